#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use kube::{api::PostParams, Api};
use thiserror::Error;

use crate::types::provider::{CAProviderClass, CA_PROVIDER_NAME};

/// Errors can be raised within reconciler
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get CAProviderClass: {0}")]
    GetCAProviderClass(#[source] kube::Error),
    #[error("Failed to create CAProviderClass: {0}")]
    CreateCAProviderClass(#[source] kube::Error),
}

/// What a successful reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The provider was already present
    Exists,
    /// The provider was created by this reconciliation
    Created,
    /// Another actor created the provider between our read and our create
    CreatedConcurrently,
}

/// Access to `CAProviderClass` objects in the cluster
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<CAProviderClass, kube::Error>;
    async fn create(
        &self,
        namespace: &str,
        provider: &CAProviderClass,
    ) -> Result<CAProviderClass, kube::Error>;
}

#[async_trait]
impl ProviderApi for kube::Client {
    async fn get(&self, namespace: &str, name: &str) -> Result<CAProviderClass, kube::Error> {
        Api::<CAProviderClass>::namespaced(self.clone(), namespace)
            .get(name)
            .await
    }

    async fn create(
        &self,
        namespace: &str,
        provider: &CAProviderClass,
    ) -> Result<CAProviderClass, kube::Error> {
        Api::<CAProviderClass>::namespaced(self.clone(), namespace)
            .create(&PostParams::default(), provider)
            .await
    }
}

fn api_error_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(api_error) => Some(api_error.code),
        _ => None,
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    api_error_code(error) == Some(404)
}

pub fn is_already_exists(error: &kube::Error) -> bool {
    api_error_code(error) == Some(409)
}

/// Make sure the `ca-provider` CAProviderClass exists in `namespace`.
///
/// Only a "not found" read leads to a create. Any other read error is returned
/// as is so a transient failure never turns into a blind create.
pub async fn reconcile_ca_provider<C>(client: &C, namespace: &str) -> Result<Outcome, Error>
where
    C: ProviderApi + ?Sized,
{
    match client.get(namespace, CA_PROVIDER_NAME).await {
        Ok(_) => {
            tracing::debug!(%namespace, "CAProviderClass already exists");
            return Ok(Outcome::Exists);
        }
        Err(error) if is_not_found(&error) => {}
        Err(error) => return Err(Error::GetCAProviderClass(error)),
    }

    let provider = CAProviderClass::for_namespace(namespace);
    match client.create(namespace, &provider).await {
        Ok(_) => {
            tracing::info!(%namespace, "created CAProviderClass");
            Ok(Outcome::Created)
        }
        Err(error) if is_already_exists(&error) => {
            tracing::info!(%namespace, "CAProviderClass was created concurrently");
            Ok(Outcome::CreatedConcurrently)
        }
        Err(error) => Err(Error::CreateCAProviderClass(error)),
    }
}
