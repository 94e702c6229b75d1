mod extraction_api;

use crate::{
    admission::DynAdmissionControl,
    api::API,
    external::{retry::RetryPolicy, DynLanguageModel},
};

pub struct Engine {
    model: DynLanguageModel,
    admission: DynAdmissionControl,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(
        model: DynLanguageModel,
        admission: DynAdmissionControl,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            admission,
            retry,
        }
    }
}

impl API for Engine {}
