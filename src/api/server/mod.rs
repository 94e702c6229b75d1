mod caller;
mod handlers;

pub use caller::CallerKey;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};

use crate::api::server::handlers::{health, locations};
use crate::api::{interface::DynAPI, API};
use crate::error::Error;

pub fn router<T: API + Sync + Send + 'static>(api: T, caller_key: CallerKey) -> Router {
    let api = Arc::new(api) as DynAPI;

    Router::new()
        .route("/health", get(health::check))
        .route("/api/locations", post(locations::extract))
        .layer(Extension(api))
        .layer(Extension(caller_key))
}

pub async fn serve<T: API + Sync + Send + 'static>(
    api: T,
    addr: SocketAddr,
    caller_key: CallerKey,
) -> Result<(), Error> {
    let server = axum::Server::try_bind(&addr).map_err(|err| {
        tracing::error!(%err, %addr, "cannot bind");
        Error::unexpected_error()
    })?;

    tracing::info!(?caller_key, "listening on {}", addr);

    let app = router(api, caller_key);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| {
            tracing::error!(%err, "server error");
            Error::unexpected_error()
        })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    tracing::info!("shutting down");
}
