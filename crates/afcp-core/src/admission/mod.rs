//! Per-client admission control.
//!
//! Combines a sliding fixed-size window with a token bucket, parameterized
//! by `{window_length, max_requests, burst}`. A request is admitted only
//! when both arms agree: the window still has request budget and the bucket
//! holds at least one token. The window arm bounds sustained throughput, the
//! bucket arm shapes bursts.
//!
//! Client ids are hashed into opaque keys before they touch any map, so raw
//! ids are never stored. State is sharded by hashed key with one mutex per
//! shard to keep contention low under concurrent callers; no lock is held
//! across anything that suspends.
//!
//! Records are created lazily on first observation and purged by [`gc`]
//! once their window start is older than two window lengths.
//!
//! [`gc`]: AdmissionController::gc

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::hash::stable_hash;

/// Number of mutex-guarded shards the client table is split across.
pub const SHARD_COUNT: usize = 16;

/// Minimum retry hint handed to rejected callers.
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Which admission arm rejected a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The sliding window's request budget was exhausted.
    Window,
    /// The token bucket was empty.
    Tokens,
}

impl RejectReason {
    /// Metrics label value for this reason.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Window => "window",
            Self::Tokens => "tokens",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// When the current window resets.
    pub reset_at: Instant,
    /// How long to wait before retrying; set only on reject.
    pub retry_after: Option<Duration>,
    /// Which arm rejected; set only on reject.
    pub reason: Option<RejectReason>,
}

#[derive(Debug, Clone)]
struct ClientRecord {
    window_start: Instant,
    requests: u32,
    tokens: f64,
    last_refill: Instant,
}

impl ClientRecord {
    fn fresh(now: Instant, burst: u32) -> Self {
        Self {
            window_start: now,
            requests: 0,
            tokens: f64::from(burst),
            last_refill: now,
        }
    }
}

type Shard = Mutex<HashMap<u32, ClientRecord>>;

/// Sharded sliding-window + token-bucket admission controller.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    shards: Vec<Shard>,
    clock: Arc<dyn Clock>,
    last_gc: Mutex<Instant>,
}

impl AdmissionController {
    /// Creates a controller with the given parameters.
    #[must_use]
    pub fn new(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            clock,
            last_gc: Mutex::new(now),
        }
    }

    /// Checks and consumes admission budget for `client_id`.
    ///
    /// Lazily creates the client record, refills tokens, rolls the window
    /// forward when it has elapsed, and admits iff the window has request
    /// budget *and* at least one token is available, decrementing both on
    /// admit.
    pub fn check(&self, client_id: &str) -> Decision {
        let key = stable_hash(client_id);
        let now = self.clock.now();
        let mut shard = self.shard_for(key);
        let record = shard
            .entry(key)
            .or_insert_with(|| ClientRecord::fresh(now, self.config.burst));

        self.refill(record, now);
        self.roll_window(record, now);

        let admitted =
            record.requests < self.config.max_requests && record.tokens >= 1.0;
        if admitted {
            record.requests += 1;
            record.tokens -= 1.0;
        }

        let reason = if admitted {
            None
        } else if record.requests >= self.config.max_requests {
            Some(RejectReason::Window)
        } else {
            Some(RejectReason::Tokens)
        };
        let decision = self.decision(record, now, reason);
        if !admitted {
            tracing::debug!(
                reason = ?reason,
                retry_after = ?decision.retry_after,
                "admission rejected"
            );
        }
        decision
    }

    /// Non-consuming variant of [`check`](Self::check).
    ///
    /// Reports what a check would decide without consuming budget and
    /// without creating a record for an unknown client.
    #[must_use]
    pub fn peek(&self, client_id: &str) -> Decision {
        let key = stable_hash(client_id);
        let now = self.clock.now();
        let shard = self.shard_for(key);

        let Some(existing) = shard.get(&key) else {
            // A fresh client would be admitted unconditionally (config
            // validation guarantees non-zero budget and burst).
            return Decision {
                allowed: true,
                remaining: self.config.max_requests,
                reset_at: now + self.config.window_length,
                retry_after: None,
                reason: None,
            };
        };

        let mut simulated = existing.clone();
        self.refill(&mut simulated, now);
        self.roll_window(&mut simulated, now);

        let would_admit =
            simulated.requests < self.config.max_requests && simulated.tokens >= 1.0;
        let reason = if would_admit {
            None
        } else if simulated.requests >= self.config.max_requests {
            Some(RejectReason::Window)
        } else {
            Some(RejectReason::Tokens)
        };
        self.decision(&simulated, now, reason)
    }

    /// Drops the record for `client_id`, returning whether one existed.
    pub fn reset(&self, client_id: &str) -> bool {
        let key = stable_hash(client_id);
        self.shard_for(key).remove(&key).is_some()
    }

    /// Purges records whose window start is older than two window lengths.
    pub fn gc(&self) {
        let now = self.clock.now();
        let horizon = self.config.window_length * 2;
        let mut purged = 0usize;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = shard.len();
            shard.retain(|_, record| {
                now.saturating_duration_since(record.window_start) <= horizon
            });
            purged += before - shard.len();
        }
        *self.last_gc.lock().unwrap_or_else(PoisonError::into_inner) = now;
        if purged > 0 {
            tracing::debug!(purged, "admission records garbage collected");
        }
    }

    /// Runs [`gc`](Self::gc) when at least one window length has elapsed
    /// since the previous purge. Returns whether a purge ran.
    pub fn maybe_gc(&self) -> bool {
        let due = {
            let last_gc = self.last_gc.lock().unwrap_or_else(PoisonError::into_inner);
            self.clock.now().saturating_duration_since(*last_gc) >= self.config.window_length
        };
        if due {
            self.gc();
        }
        due
    }

    /// Number of tracked clients, for monitoring and tests.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    fn shard_for(&self, key: u32) -> std::sync::MutexGuard<'_, HashMap<u32, ClientRecord>> {
        let idx = key as usize % self.shards.len();
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `floor(elapsed · burst / window)` tokens, capped at the burst
    /// size. The refill timestamp only moves when whole tokens were added,
    /// so fractional progress is never lost.
    fn refill(&self, record: &mut ClientRecord, now: Instant) {
        let elapsed = now.saturating_duration_since(record.last_refill);
        let to_add = (elapsed.as_secs_f64() * f64::from(self.config.burst)
            / self.config.window_length.as_secs_f64())
        .floor();
        if to_add >= 1.0 {
            record.tokens = (record.tokens + to_add).min(f64::from(self.config.burst));
            record.last_refill = now;
        }
    }

    fn roll_window(&self, record: &mut ClientRecord, now: Instant) {
        if now.saturating_duration_since(record.window_start) >= self.config.window_length {
            record.window_start = now;
            record.requests = 0;
        }
    }

    fn decision(
        &self,
        record: &ClientRecord,
        now: Instant,
        reason: Option<RejectReason>,
    ) -> Decision {
        let reset_at = record.window_start + self.config.window_length;
        let retry_after = reason.map(|reason| {
            let wait = match reason {
                RejectReason::Window => reset_at.saturating_duration_since(now),
                RejectReason::Tokens => {
                    // Time until a whole token accrues at burst/window rate.
                    let deficit = (1.0 - record.tokens).max(0.0);
                    let secs = deficit * self.config.window_length.as_secs_f64()
                        / f64::from(self.config.burst);
                    Duration::from_secs_f64(secs)
                },
            };
            wait.max(MIN_RETRY_AFTER)
        });
        Decision {
            allowed: reason.is_none(),
            remaining: self.config.max_requests.saturating_sub(record.requests),
            reset_at,
            retry_after,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;

    fn controller(window: Duration, max_requests: u32, burst: u32) -> (AdmissionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = AdmissionConfig {
            window_length: window,
            max_requests,
            burst,
        };
        (AdmissionController::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_admits_within_limits() {
        let (admission, _) = controller(Duration::from_secs(60), 5, 5);
        for i in 0..5 {
            let decision = admission.check("u1");
            assert!(decision.allowed, "request {i} should be admitted");
            assert_eq!(decision.remaining, 5 - i - 1);
        }
    }

    #[test]
    fn test_rejects_when_window_exhausted() {
        let (admission, _) = controller(Duration::from_secs(60), 3, 10);
        for _ in 0..3 {
            assert!(admission.check("u1").allowed);
        }

        let decision = admission.check("u1");
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::Window));
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after.unwrap() >= MIN_RETRY_AFTER);
    }

    #[test]
    fn test_rejects_when_tokens_exhausted() {
        // Bucket smaller than the window budget: the token arm trips first.
        let (admission, _) = controller(Duration::from_secs(60), 10, 2);
        assert!(admission.check("u1").allowed);
        assert!(admission.check("u1").allowed);

        let decision = admission.check("u1");
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectReason::Tokens));
        assert!(decision.retry_after.unwrap() >= MIN_RETRY_AFTER);
    }

    #[test]
    fn test_window_rolls_over() {
        let (admission, clock) = controller(Duration::from_secs(60), 2, 60);
        assert!(admission.check("u1").allowed);
        assert!(admission.check("u1").allowed);
        assert!(!admission.check("u1").allowed);

        clock.advance(Duration::from_secs(60));
        let decision = admission.check("u1");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let (admission, clock) = controller(Duration::from_secs(10), 100, 10);
        // Drain the bucket.
        for _ in 0..10 {
            assert!(admission.check("u1").allowed);
        }
        assert_eq!(admission.check("u1").reason, Some(RejectReason::Tokens));

        // One second accrues one token at burst/window = 1 token/s.
        clock.advance(Duration::from_secs(1));
        assert!(admission.check("u1").allowed);
        assert!(!admission.check("u1").allowed);
    }

    #[test]
    fn test_clients_are_isolated() {
        let (admission, _) = controller(Duration::from_secs(60), 1, 1);
        assert!(admission.check("u1").allowed);
        assert!(!admission.check("u1").allowed);
        assert!(admission.check("u2").allowed);
    }

    #[test]
    fn test_peek_does_not_consume_or_create() {
        let (admission, _) = controller(Duration::from_secs(60), 2, 2);

        let decision = admission.peek("u1");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(admission.tracked_clients(), 0);

        assert!(admission.check("u1").allowed);
        assert!(admission.check("u1").allowed);
        let decision = admission.peek("u1");
        assert!(!decision.allowed);
        // Peeking did not change the stored record.
        assert_eq!(admission.tracked_clients(), 1);
    }

    #[test]
    fn test_reset_forgets_client() {
        let (admission, _) = controller(Duration::from_secs(60), 1, 1);
        assert!(admission.check("u1").allowed);
        assert!(!admission.check("u1").allowed);

        assert!(admission.reset("u1"));
        assert!(!admission.reset("u1"));
        assert!(admission.check("u1").allowed);
    }

    #[test]
    fn test_gc_purges_stale_records() {
        let (admission, clock) = controller(Duration::from_secs(10), 5, 5);
        admission.check("u1");
        admission.check("u2");
        assert_eq!(admission.tracked_clients(), 2);

        // Keep u2 fresh past the horizon; u1 goes stale.
        clock.advance(Duration::from_secs(21));
        admission.check("u2");
        admission.gc();

        assert_eq!(admission.tracked_clients(), 1);
    }

    #[test]
    fn test_maybe_gc_respects_cadence() {
        let (admission, clock) = controller(Duration::from_secs(10), 5, 5);
        assert!(!admission.maybe_gc());

        clock.advance(Duration::from_secs(10));
        assert!(admission.maybe_gc());
        // Immediately after a purge the cadence gate is closed again.
        assert!(!admission.maybe_gc());
    }

    #[test]
    fn test_scenario_four_immediate_calls() {
        let (admission, _) = controller(Duration::from_secs(1), 3, 3);
        assert!(admission.check("u1").allowed);
        assert!(admission.check("u1").allowed);
        assert!(admission.check("u1").allowed);

        let fourth = admission.check("u1");
        assert!(!fourth.allowed);
        assert!(fourth.retry_after.unwrap() >= Duration::from_secs(1));
    }

    #[test]
    fn test_steady_rate_is_sustained() {
        // Arrivals at exactly max_requests / window are all admitted once
        // the bucket steadies: 10 per 10s window, one per second.
        let (admission, clock) = controller(Duration::from_secs(10), 10, 10);
        let mut admitted = 0u32;
        let total = 30u32;
        for _ in 0..total {
            if admission.check("steady").allowed {
                admitted += 1;
            }
            clock.advance(Duration::from_secs(1));
        }
        // Within ±10% of the nominal rate over three windows.
        assert!(
            (27..=30).contains(&admitted),
            "admitted {admitted} of {total}"
        );
    }

    #[test]
    fn test_concurrent_checks_respect_budget() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let (admission, _) = controller(Duration::from_secs(60), 100, 100);
        let admission = Arc::new(admission);
        let admitted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let admission = Arc::clone(&admission);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        if admission.check("shared").allowed {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::Relaxed), 100);
        assert!(!admission.check("shared").allowed);
    }

    proptest! {
        // Never admits more than max_requests within a single window,
        // whatever the arrival pattern. Admits are grouped by the window
        // they landed in via the reported reset instant.
        #[test]
        fn prop_window_budget_is_hard(
            max_requests in 1u32..20,
            burst in 1u32..40,
            arrivals in proptest::collection::vec(0u64..30_000, 1..80),
        ) {
            let clock = Arc::new(ManualClock::new());
            let config = AdmissionConfig {
                window_length: Duration::from_secs(10),
                max_requests,
                burst,
            };
            let admission = AdmissionController::new(config, clock.clone());

            let mut per_window: HashMap<Instant, u32> = HashMap::new();
            for gap_ms in arrivals {
                clock.advance(Duration::from_millis(gap_ms));
                let decision = admission.check("c");
                if decision.allowed {
                    let admitted = per_window.entry(decision.reset_at).or_insert(0);
                    *admitted += 1;
                    prop_assert!(*admitted <= max_requests);
                }
            }
        }
    }
}
