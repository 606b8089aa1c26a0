//! In-memory [`ProviderApi`] for tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use kube::core::ErrorResponse;
use parking_lot::Mutex;

use super::ProviderApi;
use crate::types::provider::CAProviderClass;

pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {} error", reason),
        reason: reason.to_string(),
        code,
    })
}

#[derive(Default)]
pub(crate) struct FakeProviderApi {
    /// namespace -> provider
    providers: Mutex<HashMap<String, CAProviderClass>>,
    get_failures: Mutex<VecDeque<kube::Error>>,
    create_failures: Mutex<VecDeque<kube::Error>>,
    get_calls: Mutex<usize>,
    create_calls: Mutex<usize>,
}

impl FakeProviderApi {
    pub(crate) fn fail_next_get(&self, error: kube::Error) {
        self.get_failures.lock().push_back(error);
    }

    pub(crate) fn fail_next_create(&self, error: kube::Error) {
        self.create_failures.lock().push_back(error);
    }

    pub(crate) fn provider(&self, namespace: &str) -> Option<CAProviderClass> {
        self.providers.lock().get(namespace).cloned()
    }

    pub(crate) fn providers(&self) -> usize {
        self.providers.lock().len()
    }

    pub(crate) fn get_calls(&self) -> usize {
        *self.get_calls.lock()
    }

    pub(crate) fn create_calls(&self) -> usize {
        *self.create_calls.lock()
    }
}

#[async_trait]
impl ProviderApi for FakeProviderApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<CAProviderClass, kube::Error> {
        *self.get_calls.lock() += 1;
        if let Some(error) = self.get_failures.lock().pop_front() {
            return Err(error);
        }
        self.providers
            .lock()
            .get(namespace)
            .filter(|provider| provider.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn create(
        &self,
        namespace: &str,
        provider: &CAProviderClass,
    ) -> Result<CAProviderClass, kube::Error> {
        *self.create_calls.lock() += 1;
        if let Some(error) = self.create_failures.lock().pop_front() {
            return Err(error);
        }
        let mut providers = self.providers.lock();
        if providers.contains_key(namespace) {
            return Err(api_error(409, "AlreadyExists"));
        }
        providers.insert(namespace.to_string(), provider.clone());
        Ok(provider.clone())
    }
}
