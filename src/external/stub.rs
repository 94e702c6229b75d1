use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::LanguageModel;
use crate::{entities::Location, error::Error};

/// Deterministic language model returning canned results.
pub struct StubModel {
    pub discovery: Result<String, Error>,
    pub structuring: Result<Vec<Location>, Error>,
    pub discovery_calls: AtomicUsize,
    pub structuring_calls: AtomicUsize,
}

impl StubModel {
    pub fn new(
        discovery: Result<String, Error>,
        structuring: Result<Vec<Location>, Error>,
    ) -> Self {
        Self {
            discovery,
            structuring,
            discovery_calls: AtomicUsize::new(0),
            structuring_calls: AtomicUsize::new(0),
        }
    }

    pub fn discovery_calls(&self) -> usize {
        self.discovery_calls.load(Ordering::SeqCst)
    }

    pub fn structuring_calls(&self) -> usize {
        self.structuring_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn discover_places(&self, _text: &str) -> Result<String, Error> {
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        self.discovery.clone()
    }

    async fn structure_locations(&self, _description: &str) -> Result<Vec<Location>, Error> {
        self.structuring_calls.fetch_add(1, Ordering::SeqCst);
        self.structuring.clone()
    }
}
