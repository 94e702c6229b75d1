pub mod openai;
pub mod retry;

#[cfg(test)]
pub mod stub;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{entities::Location, error::Error};

/// The two phases of location extraction, backed by a generative model.
#[async_trait]
pub trait LanguageModel {
    /// Web-search grounded, free-text description of up to five places
    /// matching `text`.
    async fn discover_places(&self, text: &str) -> Result<String, Error>;

    /// Schema-constrained extraction of one record per place named in
    /// `description`.
    async fn structure_locations(&self, description: &str) -> Result<Vec<Location>, Error>;
}

pub type DynLanguageModel = Arc<dyn LanguageModel + Send + Sync>;
