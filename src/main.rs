use std::sync::Arc;

use placefinder::admission::{DynAdmissionControl, MemoryAdmissionControl, PgAdmissionControl};
use placefinder::api::serve;
use placefinder::config::Settings;
use placefinder::db::PgPool;
use placefinder::engine::Engine;
use placefinder::error::Error;
use placefinder::external::openai::OpenAIClient;

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;

    let admission: DynAdmissionControl = match &settings.database_url {
        Some(url) => {
            let PgPool(pool) = PgPool::new(url, settings.database_max_connections).await?;
            Arc::new(PgAdmissionControl::new(pool, settings.policy).await?)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, rate limits are local to this process");
            Arc::new(MemoryAdmissionControl::new(settings.policy))
        }
    };

    let model = Arc::new(OpenAIClient::new(settings.openai.clone())?);
    let engine = Engine::new(model, admission, settings.retry);

    serve(engine, settings.bind_address, settings.caller_key).await
}
