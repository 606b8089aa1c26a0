//! Deduplicating work queue with rate-limited requeue.
//!
//! Keys added while pending are collapsed into one entry, and a key handed out
//! by [`WorkQueue::get`] is not handed out again until [`WorkQueue::done`] is
//! called for it. Re-adding an in-flight key marks it dirty so it is queued
//! again once the current attempt finishes.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
    time::Duration,
};

use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
const DEFAULT_QPS: f64 = 10.0;
const DEFAULT_BURST: u32 = 100;

/// Decides how long a failing key waits before it is queued again.
pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure of `key` and return the delay before its next attempt.
    fn when(&self, key: &K) -> Duration;
    /// Clear the failure history of `key`.
    fn forget(&self, key: &K);
    /// Number of failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> usize;
}

/// Per-key exponential backoff without jitter.
pub struct ItemExponentialRateLimiter<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, (usize, ExponentialBackoff)>>,
}

impl<K> ItemExponentialRateLimiter<K> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

impl<K> Default for ItemExponentialRateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<K> RateLimiter<K> for ItemExponentialRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let (count, backoff) = failures
            .entry(key.clone())
            .or_insert_with(|| (0, self.backoff()));
        *count += 1;
        backoff.next_backoff().unwrap_or(self.max_delay)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.failures.lock().get(key).map_or(0, |(count, _)| *count)
    }
}

/// Token bucket shared by every key, bounding the overall requeue rate.
pub struct BucketRateLimiter {
    /// Tokens added per second
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    /// Goes negative while requeues are waiting on future tokens
    tokens: f64,
    last_update: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_update: Instant::now(),
            }),
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_QPS, DEFAULT_BURST)
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_update);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
        bucket.last_update = now;

        // Reserve a token now and wait for it to be refilled
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> usize {
        0
    }
}

/// Applies the longest delay of all its limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> usize {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or_default()
    }
}

/// Per-key exponential backoff combined with an overall 10 qps, burst 100 bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::default()),
        Box::new(BucketRateLimiter::default()),
    ])
}

struct State<K> {
    /// Keys ready to be handed out, in insertion order
    queue: VecDeque<K>,
    /// Keys that need processing, whether queued or waiting for an in-flight attempt
    dirty: HashSet<K>,
    /// Keys currently handed out to a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

/// Cloneable handle to a rate-limited work queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(default_controller_rate_limiter())
    }
}

impl<K> WorkQueue<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    pub fn new<R>(rate_limiter: R) -> Self
    where
        R: RateLimiter<K> + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(key.clone()) {
                return;
            }
            // Requeued by `done` once the in-flight attempt finishes
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.shared.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after the delay its failure history calls for.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.shared.rate_limiter.when(&key);
        tracing::debug!(?key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.shared.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> usize {
        self.shared.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key handed out by [`WorkQueue::get`].
    pub fn done(&self, key: &K) {
        {
            let mut state = self.shared.state.lock();
            state.processing.remove(key);
            if !state.dirty.contains(key) {
                return;
            }
            state.queue.push_back(key.clone());
        }
        self.shared.notify.notify_one();
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every pending `get`.
    pub fn shut_down(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_rate_limiter() {
        let limiter = ItemExponentialRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_millis(30),
        );
        let key = "default".to_string();
        let other = "kube-system".to_string();

        assert_eq!(limiter.when(&key).as_millis(), 5);
        assert_eq!(limiter.when(&key).as_millis(), 10);
        assert_eq!(limiter.when(&key).as_millis(), 20);
        assert_eq!(limiter.when(&key).as_millis(), 30);
        assert_eq!(limiter.when(&key).as_millis(), 30);
        assert_eq!(limiter.num_requeues(&key), 5);

        // Failures are tracked per key
        assert_eq!(limiter.when(&other).as_millis(), 5);
        assert_eq!(limiter.num_requeues(&other), 1);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key).as_millis(), 5);
    }

    fn assert_delay(delay: Duration, millis: u64) {
        let expected = Duration::from_millis(millis).as_secs_f64();
        assert!(
            (delay.as_secs_f64() - expected).abs() < 1e-6,
            "expected {}ms, got {:?}",
            millis,
            delay
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_rate_limiter() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        let key = "default".to_string();

        assert_delay(limiter.when(&key), 0);
        assert_delay(limiter.when(&key), 0);
        assert_delay(limiter.when(&key), 100);
        assert_delay(limiter.when(&key), 200);
        assert_eq!(RateLimiter::<String>::num_requeues(&limiter, &key), 0);

        // Refills at qps, capped at burst
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_delay(limiter.when(&key), 0);
        assert_delay(limiter.when(&key), 0);
        assert_delay(limiter.when(&key), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_controller_rate_limiter() {
        let limiter = default_controller_rate_limiter::<String>();
        let key = "default".to_string();

        assert_delay(limiter.when(&key), 5);
        assert_delay(limiter.when(&key), 10);
        assert_eq!(limiter.num_requeues(&key), 2);
        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);

        // The shared bucket throttles once its burst is spent across keys
        for i in 0..98 {
            assert_delay(limiter.when(&format!("ns-{}", i)), 5);
        }
        assert_delay(limiter.when(&"ns-98".to_string()), 100);
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending_keys() {
        let queue = WorkQueue::<String>::default();
        queue.add("default".to_string());
        queue.add("default".to_string());
        queue.add("kube-system".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("default"));
        assert_eq!(queue.get().await.as_deref(), Some("kube-system"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_key_is_requeued_on_done() {
        let queue = WorkQueue::<String>::default();
        queue.add("default".to_string());
        let key = queue.get().await.unwrap();

        // Re-adding an in-flight key must not hand it out concurrently
        queue.add(key.clone());
        queue.add(key.clone());
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = WorkQueue::<String>::default();
        let getter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.add("default".to_string());
        assert_eq!(getter.await.unwrap().as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_shut_down_wakes_getters() {
        let queue = WorkQueue::<String>::default();
        let getter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(getter.await.unwrap(), None);

        // Adds after shutdown are dropped
        queue.add("default".to_string());
        assert!(queue.is_empty());
        assert!(queue.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited() {
        let queue = WorkQueue::<String>::default();
        let key = "default".to_string();

        let start = tokio::time::Instant::now();
        queue.add_rate_limited(key.clone());
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, Some(key.clone()));
        assert!(start.elapsed() >= Duration::from_millis(5));
        queue.done(&key);

        let start = tokio::time::Instant::now();
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.get().await, Some(key.clone()));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(queue.num_requeues(&key), 2);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }
}
