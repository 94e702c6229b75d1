use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{AdmissionControl, Decision, Policy, SlidingWindow};
use crate::error::Error;

/// Process-local admission store.
///
/// Only safe when a single instance serves all traffic; multi-instance
/// deployments need [`super::PgAdmissionControl`].
#[derive(Debug, Default)]
pub struct MemoryAdmissionControl {
    policy: Policy,
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl MemoryAdmissionControl {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AdmissionControl for MemoryAdmissionControl {
    #[tracing::instrument(skip(self))]
    async fn try_acquire(&self, identifier: &str) -> Result<Decision, Error> {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;

        // drop windows that have fully decayed
        windows.retain(|_, window| {
            window.prune(&self.policy, now);
            !window.is_empty()
        });

        let allowed = windows
            .entry(identifier.to_string())
            .or_default()
            .try_admit(&self.policy, now);

        Ok(Decision { allowed })
    }
}

#[tokio::test]
async fn admits_up_to_capacity_per_identifier() {
    let admission = MemoryAdmissionControl::new(Policy::default());

    for _ in 0..10 {
        assert!(admission.try_acquire("a").await.unwrap().allowed);
    }
    assert!(!admission.try_acquire("a").await.unwrap().allowed);

    // identifiers do not share quota
    assert!(admission.try_acquire("b").await.unwrap().allowed);
}

#[tokio::test]
async fn concurrent_calls_never_over_admit() {
    use std::sync::Arc;

    let admission = Arc::new(MemoryAdmissionControl::new(Policy::default()));

    let handles = (0..50).map(|_| {
        let admission = admission.clone();
        tokio::spawn(async move { admission.try_acquire("shared").await })
    });

    let results = futures::future::join_all(handles).await;
    let admitted = results
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .filter(|decision| decision.allowed)
        .count();

    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn quota_returns_after_window() {
    let admission = MemoryAdmissionControl::new(Policy {
        capacity: 1,
        window: chrono::Duration::milliseconds(50),
    });

    assert!(admission.try_acquire("a").await.unwrap().allowed);
    assert!(!admission.try_acquire("a").await.unwrap().allowed);

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    assert!(admission.try_acquire("a").await.unwrap().allowed);
}
