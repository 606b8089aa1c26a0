//! Namespace controller that keeps a `CAProviderClass` in every namespace.

use std::{sync::Arc, time::Duration};

use futures_util::Stream;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::watcher;
use stopper::Stopper;
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    informer::{wait_for_cache_sync, Informer, ResourceEventHandler},
    queue::WorkQueue,
    reconcile::{reconcile_ca_provider, ProviderApi},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out after {0:?} waiting for the namespace cache to sync")]
    CacheSyncTimeout(Duration),
    #[error("informer task failed: {0}")]
    Informer(#[source] tokio::task::JoinError),
}

/// Lifecycle of the controller, published for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    WaitingForCacheSync,
    Running,
    Stopped,
    Failed,
}

/// Enqueues every namespace seen for the first time. Updates and deletes are ignored.
struct EnqueueOnAdd {
    queue: WorkQueue<String>,
}

impl ResourceEventHandler<Namespace> for EnqueueOnAdd {
    fn on_add(&self, obj: &Namespace) {
        match &obj.metadata.name {
            Some(name) => self.queue.add(name.clone()),
            None => tracing::warn!(?obj.metadata, "observed namespace without a name"),
        }
    }
}

/// Namespaces are cluster-scoped, so a valid key is a bare, non-empty name.
fn is_namespace_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('/')
}

pub struct NamespaceController<C> {
    client: C,
    queue: WorkQueue<String>,
    cache_sync_timeout: Duration,
    state: watch::Sender<ControllerState>,
}

impl<C> NamespaceController<C>
where
    C: ProviderApi,
{
    pub fn new(client: C, queue: WorkQueue<String>, cache_sync_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ControllerState::WaitingForCacheSync);
        Self {
            client,
            queue,
            cache_sync_timeout,
            state,
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Enqueue a namespace for reconciliation.
    pub fn on_namespace_observed(&self, key: String) {
        self.queue.add(key);
    }

    /// Handler to register on the namespace informer
    pub fn event_handler(&self) -> Arc<dyn ResourceEventHandler<Namespace>> {
        Arc::new(EnqueueOnAdd {
            queue: self.queue.clone(),
        })
    }

    /// Take one key from the queue and reconcile it.
    ///
    /// Returns `false` once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        if !is_namespace_key(&key) {
            tracing::warn!(%key, "expected a namespace name in the work queue, dropping");
            self.queue.forget(&key);
            self.queue.done(&key);
            return true;
        }

        match reconcile_ca_provider(&self.client, &key).await {
            Ok(outcome) => {
                self.queue.forget(&key);
                tracing::info!(namespace = %key, ?outcome, "reconciled");
            }
            Err(error) => {
                tracing::error!(
                    namespace = %key,
                    %error,
                    retries = self.queue.num_requeues(&key),
                    "reconcile failed"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);

        true
    }

    pub async fn run_worker(&self) {
        while self.process_next_work_item().await {}
    }

    /// Run the controller until `stopper` fires.
    ///
    /// Fails without processing anything if the informer cache does not sync within
    /// the configured timeout.
    pub async fn run<S>(
        &self,
        mut informer: Informer<Namespace, S>,
        stopper: Stopper,
    ) -> Result<(), Error>
    where
        S: Stream<Item = Result<watcher::Event<Namespace>, watcher::Error>> + Send + 'static,
    {
        tracing::info!("starting namespace controller");
        self.state.send_replace(ControllerState::WaitingForCacheSync);

        informer.add_event_handler(self.event_handler());
        let has_synced = informer.has_synced();
        let informer_handle = tokio::spawn(informer.run(stopper.clone()));

        match wait_for_cache_sync(&stopper, self.cache_sync_timeout, has_synced).await {
            Some(true) => {}
            Some(false) => {
                tracing::error!(timeout = ?self.cache_sync_timeout, "failed to sync namespace cache");
                self.queue.shut_down();
                informer_handle.abort();
                self.state.send_replace(ControllerState::Failed);
                return Err(Error::CacheSyncTimeout(self.cache_sync_timeout));
            }
            None => {
                self.queue.shut_down();
                self.state.send_replace(ControllerState::Stopped);
                return Ok(());
            }
        }
        self.state.send_replace(ControllerState::Running);
        tracing::info!("namespace cache synced, starting worker");

        let shutdown = async {
            stopper.stop_future(std::future::pending::<()>()).await;
            tracing::info!("shutting down namespace controller");
            self.queue.shut_down();
        };
        tokio::join!(self.run_worker(), shutdown);

        let res = informer_handle.await.map_err(Error::Informer);
        self.state.send_replace(ControllerState::Stopped);
        res
    }
}
