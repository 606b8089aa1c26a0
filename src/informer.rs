//! Watch-fed local cache that dispatches add/update/delete notifications.

use std::{collections::HashSet, fmt::Debug, sync::Arc, time::Duration};

use futures_util::{Stream, StreamExt};
use kube::{
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher,
    },
    Resource,
};
use stopper::Stopper;
use tokio::sync::watch;

/// Callbacks invoked for changes observed in the cache.
///
/// Every callback defaults to a no-op so handlers only implement what they react to.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}
    fn on_update(&self, _old: &K, _new: &K) {}
    fn on_delete(&self, _obj: &K) {}
}

/// Reports whether the initial list has been applied to the cache.
#[derive(Clone)]
pub struct HasSynced(watch::Receiver<bool>);

impl HasSynced {
    /// Resolves to `true` once synced, or `false` if the informer stopped before syncing.
    pub async fn wait(&mut self) -> bool {
        loop {
            if *self.0.borrow() {
                return true;
            }
            if self.0.changed().await.is_err() {
                return *self.0.borrow();
            }
        }
    }
}

/// Wait until the cache has synced or `timeout` elapses.
///
/// Returns `None` if `stopper` fired first.
pub async fn wait_for_cache_sync(
    stopper: &Stopper,
    timeout: Duration,
    mut has_synced: HasSynced,
) -> Option<bool> {
    stopper
        .stop_future(tokio::time::timeout(timeout, has_synced.wait()))
        .await
        .map(|res| matches!(res, Ok(true)))
}

/// Local cache plus the handlers notified of its changes
struct Cache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    writer: Writer<K>,
    store: Store<K>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
    synced: watch::Sender<bool>,
}

pub struct Informer<K, S>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    events: S,
    cache: Cache<K>,
}

impl<K, S> Informer<K, S>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    /// Create an informer over a stream of watch events.
    ///
    /// The stream is expected to retry on its own; errors it yields are logged and skipped.
    pub fn new(events: S) -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        let (synced, _) = watch::channel(false);
        Self {
            events,
            cache: Cache {
                writer,
                store,
                handlers: Vec::new(),
                synced,
            },
        }
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.cache.handlers.push(handler);
    }

    pub fn has_synced(&self) -> HasSynced {
        HasSynced(self.cache.synced.subscribe())
    }

    /// Consume watch events until the stream ends or `stopper` fires.
    pub async fn run(self, stopper: Stopper) {
        let Self { events, mut cache } = self;
        futures_util::pin_mut!(events);

        while let Some(Some(event)) = stopper.stop_future(events.next()).await {
            match event {
                Ok(event) => cache.handle_event(event),
                Err(error) => tracing::warn!(%error, "watch stream error"),
            }
        }

        tracing::info!("informer stopped");
    }
}

impl<K> Cache<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    fn handle_event(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Applied(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                match old {
                    Some(old) => self.dispatch(|h| h.on_update(&old, obj)),
                    None => self.dispatch(|h| h.on_add(obj)),
                }
            }
            watcher::Event::Deleted(obj) => {
                self.writer.apply_watcher_event(&event);
                self.dispatch(|h| h.on_delete(obj));
            }
            watcher::Event::Restarted(objs) => {
                let listed = objs.iter().map(ObjectRef::from_obj).collect::<HashSet<_>>();
                let changes = objs
                    .iter()
                    .map(|obj| (self.store.get(&ObjectRef::from_obj(obj)), obj))
                    .collect::<Vec<_>>();
                let removed = self
                    .store
                    .state()
                    .into_iter()
                    .filter(|obj| !listed.contains(&ObjectRef::from_obj(&**obj)))
                    .collect::<Vec<_>>();

                self.writer.apply_watcher_event(&event);

                for (old, obj) in changes {
                    match old {
                        Some(old) => self.dispatch(|h| h.on_update(&old, obj)),
                        None => self.dispatch(|h| h.on_add(obj)),
                    }
                }
                for obj in removed {
                    self.dispatch(|h| h.on_delete(&obj));
                }

                if !*self.synced.borrow() {
                    tracing::info!(objects = objs.len(), "informer cache synced");
                    self.synced.send_replace(true);
                }
            }
        }
    }

    fn dispatch(&self, f: impl Fn(&dyn ResourceEventHandler<K>)) {
        for handler in &self.handlers {
            f(handler.as_ref());
        }
    }
}
