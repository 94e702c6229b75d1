use async_trait::async_trait;
use std::sync::Arc;

use crate::entities::Location;
use crate::error::Error;

#[async_trait]
pub trait ExtractionAPI {
    /// Turns a free-text place description into geocoded points of interest,
    /// charging one unit of `identifier`'s admission quota.
    async fn extract_locations(
        &self,
        identifier: &str,
        text: &str,
    ) -> Result<Vec<Location>, Error>;
}

pub trait API: ExtractionAPI {}

pub type DynAPI = Arc<dyn API + Send + Sync>;
