use super::Engine;

use async_trait::async_trait;

use crate::{
    api::ExtractionAPI,
    entities::{validate_all, Location},
    error::Error,
    external::retry::with_retry,
};

/// Places a single request is expected to yield.
const EXPECTED_MAX_LOCATIONS: usize = 5;

#[async_trait]
impl ExtractionAPI for Engine {
    #[tracing::instrument(skip(self, text))]
    async fn extract_locations(
        &self,
        identifier: &str,
        text: &str,
    ) -> Result<Vec<Location>, Error> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::text_required_error());
        }

        let decision = self.admission.try_acquire(identifier).await?;
        if !decision.allowed {
            tracing::info!(identifier, "rate limit exceeded");
            return Err(Error::rate_limit_error());
        }

        let model = &self.model;

        let description =
            with_retry(&self.retry, "discovery", move || model.discover_places(text)).await?;

        let description = description.as_str();
        let locations = with_retry(&self.retry, "structuring", move || {
            model.structure_locations(description)
        })
        .await?;

        validate_all(&locations)?;

        if locations.len() > EXPECTED_MAX_LOCATIONS {
            tracing::warn!(
                count = locations.len(),
                "model returned more places than asked for"
            );
        }

        tracing::info!(count = locations.len(), "locations extracted");

        Ok(locations)
    }
}

#[cfg(test)]
fn engine(model: std::sync::Arc<crate::external::stub::StubModel>, capacity: usize) -> Engine {
    use crate::admission::{MemoryAdmissionControl, Policy};
    use crate::external::retry::RetryPolicy;
    use std::sync::Arc;

    Engine::new(
        model,
        Arc::new(MemoryAdmissionControl::new(Policy {
            capacity,
            ..Policy::default()
        })),
        RetryPolicy {
            timeout: std::time::Duration::from_millis(200),
            max_retries: 2,
            backoff: std::time::Duration::from_millis(1),
        },
    )
}

#[cfg(test)]
fn paris_landmarks() -> Vec<Location> {
    use crate::entities::Coordinates;

    vec![
        Location {
            name: "Eiffel Tower".into(),
            address: "Champ de Mars, 5 Avenue Anatole France".into(),
            city: "Paris".into(),
            state: "Île-de-France".into(),
            country: "France".into(),
            coordinates: Coordinates::new(48.8584, 2.2945),
        },
        Location {
            name: "Louvre Museum".into(),
            address: "Rue de Rivoli".into(),
            city: "Paris".into(),
            state: "Île-de-France".into(),
            country: "France".into(),
            coordinates: Coordinates::new(48.8606, 2.3376),
        },
    ]
}

#[tokio::test]
async fn blank_text_makes_no_calls_and_uses_no_quota() {
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Ok("text".into()), Ok(vec![])));
    let engine = engine(model.clone(), 1);

    for text in ["", " ", "\t\n"] {
        let err = engine.extract_locations("global", text).await.unwrap_err();
        assert!(err.is_text_required_error());
    }

    assert_eq!(model.discovery_calls(), 0);
    assert_eq!(model.structuring_calls(), 0);

    // the single unit of quota is still available
    tokio_test::assert_ok!(engine.extract_locations("global", "parks").await);
}

#[tokio::test]
async fn eleventh_call_is_rejected_before_the_model() {
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Ok("text".into()), Ok(vec![])));
    let engine = engine(model.clone(), 10);

    for _ in 0..10 {
        tokio_test::assert_ok!(engine.extract_locations("global", "museums").await);
    }

    let err = engine.extract_locations("global", "museums").await.unwrap_err();
    assert!(err.is_rate_limit_error());
    assert_eq!(model.discovery_calls(), 10);

    // other identifiers are unaffected
    tokio_test::assert_ok!(engine.extract_locations("address:10.0.0.2", "museums").await);
}

#[tokio::test]
async fn paris_landmarks_are_structured() {
    use crate::entities::Coordinates;
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    let discovery = "1. The Eiffel Tower, Paris. 2. Louvre Museum, Paris.";
    let model = Arc::new(StubModel::new(Ok(discovery.into()), Ok(paris_landmarks())));
    let engine = engine(model, 10);

    let locations = engine
        .extract_locations("global", "famous landmarks in Paris")
        .await
        .unwrap();

    assert_eq!(locations.len(), 2);
    for location in &locations {
        assert_eq!(location.city, "Paris");
        assert_eq!(location.country, "France");
    }

    let eiffel = Coordinates::new(48.8584, 2.2945);
    let louvre = Coordinates::new(48.8606, 2.3376);
    assert!(locations[0].coordinates.distance_degrees(&eiffel) <= 0.5);
    assert!(locations[1].coordinates.distance_degrees(&louvre) <= 0.5);
}

#[tokio::test]
async fn discovery_failure_skips_structuring() {
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(
        Err(Error::upstream_rejected_error()),
        Ok(paris_landmarks()),
    ));
    let engine = engine(model.clone(), 10);

    let err = engine.extract_locations("global", "paris").await.unwrap_err();

    assert_eq!(err, Error::upstream_rejected_error());
    assert_eq!(model.discovery_calls(), 1);
    assert_eq!(model.structuring_calls(), 0);
}

#[tokio::test]
async fn transient_discovery_failure_is_retried_then_surfaced() {
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Err(Error::upstream_error()), Ok(vec![])));
    let engine = engine(model.clone(), 10);

    let err = engine.extract_locations("global", "paris").await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(model.discovery_calls(), 3);
    assert_eq!(model.structuring_calls(), 0);
}

#[tokio::test]
async fn malformed_record_fails_the_batch() {
    use crate::entities::Coordinates;
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    let mut locations = paris_landmarks();
    locations[1].coordinates = Coordinates::new(248.86, 2.3376);

    let model = Arc::new(StubModel::new(Ok("text".into()), Ok(locations)));
    let engine = engine(model.clone(), 10);

    let err = engine.extract_locations("global", "paris").await.unwrap_err();

    assert!(err.is_malformed_output_error());
    assert_eq!(model.structuring_calls(), 1);
}

#[tokio::test]
async fn deterministic_model_gives_same_output() {
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Ok("text".into()), Ok(paris_landmarks())));
    let engine = engine(model, 10);

    let first = engine.extract_locations("global", "paris").await.unwrap();
    let second = engine.extract_locations("global", "paris").await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn unavailable_admission_fails_closed() {
    use crate::admission::{AdmissionControl, Decision};
    use crate::external::stub::StubModel;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl AdmissionControl for Unreachable {
        async fn try_acquire(&self, _identifier: &str) -> Result<Decision, Error> {
            Err(Error::admission_unavailable_error("connection refused"))
        }
    }

    let model = Arc::new(StubModel::new(Ok("text".into()), Ok(vec![])));
    let engine = Engine::new(model.clone(), Arc::new(Unreachable), Default::default());

    let err = engine.extract_locations("global", "paris").await.unwrap_err();

    assert!(err.is_admission_unavailable_error());
    assert_eq!(model.discovery_calls(), 0);
}
