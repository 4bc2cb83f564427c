//! Retry delay policies for work queue keys and token buckets for
//! bounding the overall rate of actions.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

/// Decides how long a failing key waits before its next attempt
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before the next attempt; records one more failure for `item`
    fn when(&self, item: &K) -> Duration;

    /// Clear all failure history for `item`
    fn forget(&self, item: &K);

    /// Failures recorded since the last `forget`
    fn num_requeues(&self, item: &K) -> u32;

    /// Drop state for keys that have been idle long enough to be irrelevant
    fn gc(&self) {}
}

struct FailureEntry {
    failures: u32,
    last_update: Instant,
    rng: StdRng,
}

/// Per-key exponential backoff: `min(base * 2^failures, max)`, jittered.
///
/// Each key draws its jitter from its own RNG so that keys failing in
/// lock-step spread out instead of retrying together.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    jitter: f64,
    seed: u64,
    entries: Mutex<HashMap<K, FailureEntry>>,
}

impl<K: Hash + Eq + Clone> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self::with_jitter(base, max, 0.2)
    }

    /// `jitter` is the maximum relative deviation, e.g. `0.2` for +-20%
    pub fn with_jitter(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            seed: rand::rng().random(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn rng_for(&self, item: &K) -> StdRng {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish() ^ self.seed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K> RateLimiter<K> for ItemExponentialFailureRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    fn when(&self, item: &K) -> Duration {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(item.clone())
            .or_insert_with(|| FailureEntry {
                failures: 0,
                last_update: now,
                rng: self.rng_for(item),
            });

        let exp = entry.failures;
        entry.failures = entry.failures.saturating_add(1);
        entry.last_update = now;

        let max = self.max.as_secs_f64();
        let backoff = self.base.as_secs_f64() * 2f64.powi(exp.min(1023) as i32);
        let backoff = if backoff.is_finite() { backoff.min(max) } else { max };

        let factor = if self.jitter > 0.0 {
            1.0 + entry.rng.random_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((backoff * factor).clamp(0.0, max))
    }

    fn forget(&self, item: &K) {
        self.entries.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.entries
            .lock()
            .get(item)
            .map(|e| e.failures)
            .unwrap_or(0)
    }

    fn gc(&self) {
        let now = Instant::now();
        let horizon = self.max * 2;
        self.entries
            .lock()
            .retain(|_, e| now.duration_since(e.last_update) <= horizon);
    }
}

struct BucketState {
    tokens: f64,
    last: Instant,
    qps: f64,
}

/// Classic token bucket: refills at `qps` up to `burst`
pub struct TokenBucket {
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A bucket that starts full
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
                qps: qps.max(0.0),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.qps).min(self.burst);
        state.last = now;
    }

    /// Take a token if one is available right now
    pub fn try_accept(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, possibly borrowing from the future; returns how long
    /// the caller must wait before acting on it
    pub fn reserve(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            return Duration::ZERO;
        }
        if state.qps <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(-state.tokens / state.qps)
    }

    /// Change the refill rate, keeping the tokens accrued so far
    pub fn set_rate(&self, qps: f64) {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.qps = qps.max(0.0);
    }

    pub fn qps(&self) -> f64 {
        self.state.lock().qps
    }
}

/// Bounds the overall retry rate across all keys
pub struct BucketRateLimiter {
    bucket: TokenBucket,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: TokenBucket::new(qps, burst),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        self.bucket.reserve()
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// The longest delay of any inner limiter wins
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }

    fn gc(&self) {
        for limiter in &self.limiters {
            limiter.gc();
        }
    }
}

/// Per-key exponential 5ms..1000s combined with an overall 10 qps / 100 burst bucket
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

/// Unkeyed exponential backoff for reconnect loops
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// The next wait, doubling from `initial` up to `max`, with up to 10% jitter
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        let jitter = rand::rng().random_range(0.0..=0.1);
        next.mul_f64(1.0 + jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_without_jitter() {
        let limiter = ItemExponentialFailureRateLimiter::with_jitter(
            Duration::from_millis(5),
            Duration::from_secs(1),
            0.0,
        );

        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&"a"), 3);

        // Other keys are independent
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));

        for _ in 0..20 {
            limiter.when(&"c");
        }
        assert_eq!(limiter.when(&"c"), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let limiter = ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(100),
            Duration::from_secs(100),
        );
        for k in 1..=8u32 {
            let delay = limiter.when(&"x").as_secs_f64();
            let nominal = 0.1 * 2f64.powi(k as i32 - 1);
            assert!(delay >= nominal * 0.8 - 1e-9, "{} < {}", delay, nominal * 0.8);
            assert!(delay <= nominal * 1.2 + 1e-9, "{} > {}", delay, nominal * 1.2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_drops_idle_entries() {
        let limiter = ItemExponentialFailureRateLimiter::with_jitter(
            Duration::from_millis(5),
            Duration::from_secs(10),
            0.0,
        );
        limiter.when(&"old");
        tokio::time::advance(Duration::from_secs(15)).await;
        limiter.when(&"fresh");
        tokio::time::advance(Duration::from_secs(6)).await;

        limiter.gc();
        assert_eq!(limiter.num_requeues(&"old"), 0);
        assert_eq!(limiter.num_requeues(&"fresh"), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket() {
        let bucket = TokenBucket::new(2.0, 2);
        assert!(bucket.try_accept());
        assert!(bucket.try_accept());
        assert!(!bucket.try_accept());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_accept());
        assert!(!bucket.try_accept());

        // Borrowing from the future
        assert_eq!(bucket.reserve(), Duration::from_millis(500));

        bucket.set_rate(0.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!bucket.try_accept());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_takes_longest() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::with_jitter(
                Duration::from_millis(5),
                Duration::from_secs(1000),
                0.0,
            )),
            Box::new(BucketRateLimiter::new(1.0, 1)),
        ]);

        // First call: bucket has a token, exponential says 5ms
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        // Second call: bucket is empty and needs a full second
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
    }

    #[test]
    fn test_backoff_doubles_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(800), Duration::from_secs(30));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(880));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_secs(1));
    }
}
