use axum::extract::{rejection::JsonRejection, ConnectInfo, Extension, Json};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::Instrument;
use uuid::Uuid;

use crate::api::{interface::DynAPI, server::CallerKey};
use crate::entities::Location;
use crate::error::Error;

#[derive(Deserialize)]
pub struct ExtractParams {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub locations: Vec<Location>,
}

pub async fn extract(
    Extension(api): Extension<DynAPI>,
    Extension(caller_key): Extension<CallerKey>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    params: Result<Json<ExtractParams>, JsonRejection>,
) -> Result<Json<ExtractResponse>, Error> {
    let text = match params {
        Ok(Json(params)) => params.text.unwrap_or_default(),
        Err(rejection) => {
            tracing::info!(%rejection, "unreadable extraction request");
            return Err(Error::text_required_error());
        }
    };

    let identifier = caller_key.identify(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let request_id = Uuid::new_v4();

    let locations = api
        .extract_locations(&identifier, &text)
        .instrument(tracing::info_span!("extract", %request_id))
        .await?;

    Ok(ExtractResponse { locations }.into())
}

#[cfg(test)]
fn engine_with(
    model: std::sync::Arc<crate::external::stub::StubModel>,
    capacity: usize,
) -> DynAPI {
    use crate::admission::{MemoryAdmissionControl, Policy};
    use crate::engine::Engine;
    use std::sync::Arc;

    let admission = Arc::new(MemoryAdmissionControl::new(Policy {
        capacity,
        ..Policy::default()
    }));

    Arc::new(Engine::new(model, admission, Default::default()))
}

#[cfg(test)]
async fn call(api: &DynAPI, text: Option<&str>) -> axum::response::Response {
    use axum::response::IntoResponse;

    let params = ExtractParams {
        text: text.map(String::from),
    };

    extract(
        Extension(api.clone()),
        Extension(CallerKey::Global),
        None,
        HeaderMap::new(),
        Ok(Json(params)),
    )
    .await
    .into_response()
}

/// Runs a raw request body through the real JSON extractor before the handler.
#[cfg(test)]
async fn call_raw(
    api: &DynAPI,
    content_type: Option<&str>,
    body: &'static str,
) -> axum::response::Response {
    use axum::body::Body;
    use axum::extract::{FromRequest, RequestParts};
    use axum::http::{header::CONTENT_TYPE, Request};
    use axum::response::IntoResponse;

    let mut request = Request::builder().method("POST").uri("/api/locations");
    if let Some(content_type) = content_type {
        request = request.header(CONTENT_TYPE, content_type);
    }

    let mut parts = RequestParts::new(request.body(Body::from(body)).unwrap());
    let params = Json::<ExtractParams>::from_request(&mut parts).await;

    extract(
        Extension(api.clone()),
        Extension(CallerKey::Global),
        None,
        HeaderMap::new(),
        params,
    )
    .await
    .into_response()
}

#[cfg(test)]
async fn body_json(response: axum::response::Response) -> serde_json::Value {
    use axum::body::HttpBody;

    let mut body = response.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }

    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_text_is_bad_request() {
    use crate::external::stub::StubModel;
    use axum::http::StatusCode;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Ok("".into()), Ok(vec![])));
    let api = engine_with(model.clone(), 10);

    for text in [None, Some(""), Some("   \n")] {
        let response = call(&api, text).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "Text is required" })
        );
    }

    assert_eq!(model.discovery_calls(), 0);
    assert_eq!(model.structuring_calls(), 0);
}

#[tokio::test]
async fn unreadable_body_is_bad_request() {
    use crate::external::stub::StubModel;
    use axum::http::StatusCode;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Ok("Somewhere.".into()), Ok(vec![])));
    let api = engine_with(model.clone(), 10);

    let cases = [
        (Some("application/json"), "not json"),
        (Some("application/json"), r#"{"text": 5}"#),
        (Some("text/plain"), r#"{"text": "parks"}"#),
        (None, r#"{"text": "parks"}"#),
    ];

    for (content_type, body) in cases {
        let response = call_raw(&api, content_type, body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "Text is required" })
        );
    }

    assert_eq!(model.discovery_calls(), 0);

    // the same extractor accepts a well-formed body
    let response = call_raw(&api, Some("application/json"), r#"{"text": "parks"}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(model.discovery_calls(), 1);
}

#[tokio::test]
async fn rotating_unknown_api_keys_share_one_quota() {
    use crate::external::stub::StubModel;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Ok("Somewhere.".into()), Ok(vec![])));
    let api = engine_with(model.clone(), 10);
    let caller_key = CallerKey::new("api_key", Some("team-a=sk-issued")).unwrap();

    let call_with_key = |key: String| {
        let api = api.clone();
        let caller_key = caller_key.clone();
        async move {
            let mut headers = HeaderMap::new();
            headers.insert("x-api-key", key.parse().unwrap());

            extract(
                Extension(api),
                Extension(caller_key),
                None,
                headers,
                Ok(Json(ExtractParams {
                    text: Some("cafes".into()),
                })),
            )
            .await
            .into_response()
            .status()
        }
    };

    let mut statuses = Vec::new();
    for i in 0..15 {
        statuses.push(call_with_key(format!("made-up-{}", i)).await);
    }

    assert_eq!(
        statuses.iter().filter(|status| **status == StatusCode::OK).count(),
        10
    );
    assert_eq!(statuses[10..], [StatusCode::TOO_MANY_REQUESTS; 5]);

    // the issued key still has its own quota
    assert_eq!(call_with_key("sk-issued".into()).await, StatusCode::OK);
    assert_eq!(model.discovery_calls(), 11);
}

#[tokio::test]
async fn success_returns_locations() {
    use crate::entities::sample;
    use crate::external::stub::StubModel;
    use axum::http::StatusCode;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(
        Ok("The Eiffel Tower in Paris.".into()),
        Ok(vec![sample("Eiffel Tower", 48.8584, 2.2945)]),
    ));
    let api = engine_with(model, 10);

    let response = call(&api, Some("iron tower in paris")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let locations = body["locations"].as_array().unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0]["name"], "Eiffel Tower");
    assert_eq!(locations[0]["coordinates"]["latitude"], 48.8584);
}

#[tokio::test]
async fn over_quota_is_too_many_requests() {
    use crate::external::stub::StubModel;
    use axum::http::StatusCode;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(Ok("Somewhere.".into()), Ok(vec![])));
    let api = engine_with(model.clone(), 2);

    assert_eq!(call(&api, Some("cafes")).await.status(), StatusCode::OK);
    assert_eq!(call(&api, Some("cafes")).await.status(), StatusCode::OK);

    let response = call(&api, Some("cafes")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "error": "Rate limit exceeded" })
    );

    assert_eq!(model.discovery_calls(), 2);
}

#[tokio::test]
async fn model_failure_is_opaque_server_error() {
    use crate::external::stub::StubModel;
    use axum::http::StatusCode;
    use std::sync::Arc;

    let model = Arc::new(StubModel::new(
        Ok("Somewhere.".into()),
        Err(Error::malformed_output_error("schema mismatch: missing field `city`")),
    ));
    let api = engine_with(model, 10);

    let response = call(&api, Some("cafes")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "error": "Internal Server Error" })
    );
}
