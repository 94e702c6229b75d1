use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::database_error(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::reqwest_error(err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.code {
            9 => (StatusCode::SERVICE_UNAVAILABLE, self.message.as_str()),
            1..=99 => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            102 => (StatusCode::TOO_MANY_REQUESTS, self.message.as_str()),
            _ => (StatusCode::BAD_REQUEST, self.message.as_str()),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl Error {
    pub fn config_error(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }

    pub fn database_error<T: Debug>(err: T) -> Self {
        tracing::error!(?err, "database error");

        Self {
            code: 2,
            message: "database error".into(),
        }
    }

    pub fn reqwest_error(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::timeout_error();
        }

        // a request that cannot be built fails the same way on every attempt
        if err.is_builder() {
            tracing::error!(%err, "cannot build upstream request");
            return Self::config_error("invalid upstream request");
        }

        tracing::warn!(%err, "upstream request failed");

        Self {
            code: 3,
            message: "reqwest error".into(),
        }
    }

    pub fn upstream_error() -> Self {
        Self {
            code: 4,
            message: "upstream error".into(),
        }
    }

    pub fn unexpected_error() -> Self {
        Self {
            code: 5,
            message: "unexpected error".into(),
        }
    }

    pub fn timeout_error() -> Self {
        Self {
            code: 6,
            message: "upstream timeout".into(),
        }
    }

    pub fn malformed_output_error(message: impl Into<String>) -> Self {
        Self {
            code: 7,
            message: message.into(),
        }
    }

    pub fn upstream_rejected_error() -> Self {
        Self {
            code: 8,
            message: "upstream rejected request".into(),
        }
    }

    pub fn admission_unavailable_error<T: Debug>(err: T) -> Self {
        tracing::error!(?err, "admission control store unavailable");

        Self {
            code: 9,
            message: "Admission control unavailable".into(),
        }
    }

    pub fn text_required_error() -> Self {
        Self {
            code: 101,
            message: "Text is required".into(),
        }
    }

    pub fn rate_limit_error() -> Self {
        Self {
            code: 102,
            message: "Rate limit exceeded".into(),
        }
    }

    /// Failures worth another attempt against the same upstream.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, 3 | 4 | 6)
    }

    pub fn is_malformed_output_error(&self) -> bool {
        self.code == 7
    }

    pub fn is_text_required_error(&self) -> bool {
        self.code == 101
    }

    pub fn is_rate_limit_error(&self) -> bool {
        self.code == 102
    }

    pub fn is_admission_unavailable_error(&self) -> bool {
        self.code == 9
    }
}

#[test]
fn error_status_mapping() {
    let cases = [
        (Error::text_required_error(), StatusCode::BAD_REQUEST),
        (Error::rate_limit_error(), StatusCode::TOO_MANY_REQUESTS),
        (
            Error::admission_unavailable_error("connection refused"),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (Error::upstream_error(), StatusCode::INTERNAL_SERVER_ERROR),
        (Error::timeout_error(), StatusCode::INTERNAL_SERVER_ERROR),
        (
            Error::malformed_output_error("bad latitude"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];

    for (err, status) in cases {
        assert_eq!(err.into_response().status(), status);
    }
}

#[test]
fn transient_classification() {
    assert!(Error::upstream_error().is_transient());
    assert!(Error::timeout_error().is_transient());
    assert!(!Error::malformed_output_error("missing field").is_transient());
    assert!(!Error::upstream_rejected_error().is_transient());
    assert!(!Error::rate_limit_error().is_transient());
}

#[test]
fn unbuildable_request_is_not_retried() {
    let err = reqwest::Client::new()
        .get("not a url")
        .build()
        .unwrap_err();
    assert!(err.is_builder());

    let err = Error::from(err);
    assert!(!err.is_transient());
    assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
}
