//! Token-bucket engine.

use std::time::Duration;

use tracing::{debug, trace};

use super::guard::KeyGuard;
use super::policy::{BucketState, Decision, Policy};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::{Atomicity, Store, TakeRequest};

/// Admission control over a [`Store`] with one [`Policy`] for every key.
///
/// With a [`Atomicity::ProcessLocal`] store each call runs get, refill and set
/// while holding the key's shard of a [`KeyGuard`]. With a
/// [`Atomicity::ServerSide`] store the whole transition is one
/// [`Store::take`] and no local lock is taken.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
#[derive(Debug)]
pub struct TokenBucket<S, C = SystemClock> {
    policy: Policy,
    store: S,
    clock: C,
    guard: Option<KeyGuard>,
    store_timeout: Option<Duration>,
}

impl<S: Store> TokenBucket<S, SystemClock> {
    /// Create an engine reading the system clock.
    pub fn new(policy: Policy, store: S) -> Self {
        Self::with_clock(policy, store, SystemClock)
    }
}

impl<S: Store, C: Clock> TokenBucket<S, C> {
    /// Create an engine reading `clock`.
    pub fn with_clock(policy: Policy, store: S, clock: C) -> Self {
        let guard = match store.atomicity() {
            Atomicity::ProcessLocal => Some(KeyGuard::default()),
            Atomicity::ServerSide => None,
        };
        Self {
            policy,
            store,
            clock,
            guard,
            store_timeout: None,
        }
    }

    /// Change the number of lock shards. No effect for atomic stores.
    pub fn with_guard_shards(mut self, shards: usize) -> Self {
        if self.guard.is_some() {
            self.guard = Some(KeyGuard::new(shards));
        }
        self
    }

    /// Fail calls whose store work does not finish within `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// The policy applied to every key.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Try to deduct `cost` tokens from `key`'s bucket.
    ///
    /// `Ok(false)` means rate limited. Errors mean no decision could be made.
    pub async fn allow(&self, key: &str, cost: i64) -> Result<bool> {
        self.take(key, cost).await.map(|d| d.admitted)
    }

    /// Like [`allow`](Self::allow), returning the full decision.
    ///
    /// A cost above capacity is rejected without touching the store; its
    /// decision reports zero remaining tokens.
    pub async fn take(&self, key: &str, cost: i64) -> Result<Decision> {
        self.policy.check_cost(cost)?;
        if !self.policy.is_satisfiable(cost) {
            debug!(
                key = %key,
                cost,
                capacity = self.policy.capacity(),
                "Cost exceeds capacity, rejecting"
            );
            return Ok(Decision {
                admitted: false,
                state: BucketState::default(),
            });
        }

        trace!(key = %key, cost, "Checking token bucket");

        let decision = match self.store_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(key, cost))
                .await
                .map_err(|_| {
                    TollgateError::StoreTimeout(format!("no answer within {:?}", limit))
                })??,
            None => self.run(key, cost).await?,
        };

        if decision.admitted {
            trace!(key = %key, remaining = decision.remaining(), "Admitted");
        } else {
            debug!(
                key = %key,
                cost,
                tokens = decision.remaining(),
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    async fn run(&self, key: &str, cost: i64) -> Result<Decision> {
        match &self.guard {
            Some(guard) => self.run_guarded(guard, key, cost).await,
            None => {
                let now = self.clock.now_nanos();
                self.policy.check_now(now)?;
                let request = TakeRequest {
                    cost,
                    now,
                    policy: self.policy,
                };
                let decision = self.store.take(key, request).await?;
                self.policy.check_state(key, &decision.state)?;
                Ok(decision)
            }
        }
    }

    async fn run_guarded(&self, guard: &KeyGuard, key: &str, cost: i64) -> Result<Decision> {
        let _lock = guard.lock(key).await;
        // Read the clock under the lock so timestamps land in lock order.
        let now = self.clock.now_nanos();
        take_from(&self.store, key, TakeRequest { cost, now, policy: self.policy }).await
    }
}

/// One get-apply-set cycle against a store. The caller provides exclusion.
pub(crate) async fn take_from<S: Store + ?Sized>(
    store: &S,
    key: &str,
    request: TakeRequest,
) -> Result<Decision> {
    request.policy.check_now(request.now)?;
    let state = store.get(key).await?;
    request.policy.check_state(key, &state)?;
    let decision = request.policy.apply(state, request.now, request.cost);
    store.set(key, decision.state).await?;
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn engine(rate: f64, capacity: i64) -> (TokenBucket<Arc<MemoryStore>, ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new());
        let policy = Policy::new(rate, capacity).unwrap();
        (TokenBucket::with_clock(policy, store, clock.clone()), clock)
    }

    /// Fails every call.
    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn get(&self, _key: &str) -> Result<BucketState> {
            Err(TollgateError::StoreUnavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _state: BucketState) -> Result<()> {
            Err(TollgateError::StoreUnavailable("connection refused".into()))
        }
    }

    /// Counts calls and sleeps before answering reads.
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Store for SlowStore {
        async fn get(&self, key: &str) -> Result<BucketState> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, state: BucketState) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, state).await
        }
    }

    /// Applies takes itself under one mutex.
    #[derive(Default)]
    struct AtomicTable {
        inner: MemoryStore,
        lock: tokio::sync::Mutex<()>,
        takes: AtomicUsize,
    }

    #[async_trait]
    impl Store for AtomicTable {
        async fn get(&self, key: &str) -> Result<BucketState> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, state: BucketState) -> Result<()> {
            self.inner.set(key, state).await
        }

        fn atomicity(&self) -> Atomicity {
            Atomicity::ServerSide
        }

        async fn take(&self, key: &str, request: TakeRequest) -> Result<Decision> {
            self.takes.fetch_add(1, Ordering::SeqCst);
            let _lock = self.lock.lock().await;
            let state = self.inner.get(key).await?;
            let decision = request.policy.apply(state, request.now, request.cost);
            self.inner.set(key, decision.state).await?;
            Ok(decision)
        }
    }

    #[tokio::test]
    async fn test_fresh_bucket_admits() {
        let (limiter, _clock) = engine(1.0, 5);
        assert!(limiter.allow("user:1", 5).await.unwrap());
        assert_eq!(limiter.store().get("user:1").await.unwrap().tokens, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_then_recovery() {
        let (limiter, clock) = engine(1.0, 5);
        let key = "user:1";

        assert!(limiter.allow(key, 1).await.unwrap());
        assert!(!limiter.allow(key, 5).await.unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(limiter.allow(key, 3).await.unwrap());
        assert_eq!(limiter.store().get(key).await.unwrap().tokens, 2);
    }

    #[tokio::test]
    async fn test_burst_only_policy() {
        let (limiter, clock) = engine(0.0, 3);

        for _ in 0..3 {
            assert!(limiter.allow("k", 1).await.unwrap());
        }
        assert!(!limiter.allow("k", 1).await.unwrap());

        clock.advance(Duration::from_secs(86_400));
        assert!(!limiter.allow("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsatisfiable_cost_skips_store() {
        let store = Arc::new(SlowStore::default());
        let limiter = TokenBucket::with_clock(
            Policy::new(100.0, 10).unwrap(),
            store.clone(),
            ManualClock::default(),
        );

        let decision = limiter.take("k", 11).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_positive_cost_is_invalid() {
        let (limiter, _clock) = engine(1.0, 5);
        assert!(matches!(
            limiter.allow("k", 0).await,
            Err(TollgateError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.allow("k", -1).await,
            Err(TollgateError::InvalidArgument(_))
        ));
        assert!(limiter.store().is_empty());
    }

    #[tokio::test]
    async fn test_refill_between_calls() {
        let (limiter, clock) = engine(2.0, 10);
        let key = "k";

        limiter.allow(key, 9).await.unwrap();
        clock.advance(Duration::from_millis(2_700));
        // floor(2.7 * 2) = 5 tokens back
        let decision = limiter.take(key, 7).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.remaining(), 6);
    }

    #[tokio::test]
    async fn test_rejection_persists_refill() {
        let (limiter, clock) = engine(1.0, 10);
        let key = "k";

        limiter.allow(key, 10).await.unwrap();
        clock.advance(Duration::from_secs(3));
        assert!(!limiter.allow(key, 4).await.unwrap());

        let state = limiter.store().get(key).await.unwrap();
        assert_eq!(state.tokens, 3);
        assert_eq!(state.last_refill, clock.now_nanos());
    }

    #[tokio::test]
    async fn test_fractional_time_is_not_lost() {
        let (limiter, clock) = engine(1.0, 10);
        let key = "k";

        limiter.allow(key, 10).await.unwrap();
        for _ in 0..3 {
            clock.advance(Duration::from_millis(300));
            assert!(!limiter.allow(key, 1).await.unwrap());
        }
        // 1.2s accumulated across calls
        clock.advance(Duration::from_millis(300));
        assert!(limiter.allow(key, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_clock_going_backwards_adds_nothing() {
        let (limiter, clock) = engine(1.0, 5);
        let key = "k";

        limiter.allow(key, 5).await.unwrap();
        let before = limiter.store().get(key).await.unwrap();

        clock.set(before.last_refill - 60_000_000_000);
        assert!(!limiter.allow(key, 1).await.unwrap());
        assert_eq!(limiter.store().get(key).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_clock_at_or_before_epoch_is_refused() {
        for reading in [0, -5] {
            let clock = ManualClock::new(reading);
            let limiter = TokenBucket::with_clock(
                Policy::new(0.0, 1).unwrap(),
                MemoryStore::new(),
                clock,
            );

            for _ in 0..3 {
                assert!(matches!(
                    limiter.allow("k", 1).await,
                    Err(TollgateError::InvalidArgument(_))
                ));
            }
            assert!(limiter.store().is_empty());
        }
    }

    #[tokio::test]
    async fn test_atomic_store_never_sees_pre_epoch_clock() {
        let store = Arc::new(AtomicTable::default());
        let limiter =
            TokenBucket::with_clock(Policy::new(1.0, 5).unwrap(), store.clone(), ManualClock::new(0));

        assert!(matches!(
            limiter.allow("k", 1).await,
            Err(TollgateError::InvalidArgument(_))
        ));
        assert_eq!(store.takes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let limiter = TokenBucket::new(Policy::new(1.0, 5).unwrap(), BrokenStore);
        let err = limiter.allow("k", 1).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let (limiter, _clock) = engine(1.0, 5);
        limiter
            .store()
            .set("k", BucketState::new(50, 123))
            .await
            .unwrap();

        assert!(matches!(
            limiter.allow("k", 1).await,
            Err(TollgateError::InvalidState { tokens: 50, capacity: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_store_timeout_persists_nothing() {
        let store = Arc::new(SlowStore {
            delay: Duration::from_millis(200),
            ..SlowStore::default()
        });
        let limiter = TokenBucket::with_clock(
            Policy::new(1.0, 5).unwrap(),
            store.clone(),
            ManualClock::default(),
        )
        .with_store_timeout(Duration::from_millis(20));

        let err = limiter.allow("k", 1).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreTimeout(_)));
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_atomic_store_bypasses_guard() {
        let store = Arc::new(AtomicTable::default());
        let limiter = TokenBucket::with_clock(
            Policy::new(1.0, 2).unwrap(),
            store.clone(),
            ManualClock::default(),
        );

        assert!(limiter.guard.is_none());
        assert!(limiter.allow("k", 2).await.unwrap());
        assert!(!limiter.allow("k", 1).await.unwrap());
        assert_eq!(store.takes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exact_exhaustion() {
        let (limiter, _clock) = engine(10.0, 20);
        let limiter = Arc::new(limiter.with_guard_shards(1));

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("hot", 1).await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 20);
        assert_eq!(limiter.store().get("hot").await.unwrap().tokens, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_with_real_clock_stays_bounded() {
        let policy = Policy::new(10.0, 20).unwrap();
        let limiter = Arc::new(TokenBucket::new(policy, MemoryStore::new()));
        let started = std::time::Instant::now();

        let handles: Vec<_> = (0..30)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("hot", 1).await.unwrap() })
            })
            .collect();
        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        let earned = (started.elapsed().as_secs_f64() * 10.0).floor() as usize;
        assert!(admitted >= 20);
        assert!(admitted <= 20 + earned);
    }
}
