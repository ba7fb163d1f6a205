//! Bucket state and the refill/consume arithmetic.
//!
//! Everything here is pure: the engine and the shared store server both feed
//! a state read from storage through [`Policy::apply`] and persist the result.

use std::time::Duration;

use crate::error::{Result, TollgateError};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Persisted state of one caller key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketState {
    /// Tokens currently available
    pub tokens: i64,
    /// Nanoseconds since the Unix epoch of the last refill, 0 if never written
    pub last_refill: i64,
}

impl BucketState {
    /// Create a state record.
    pub fn new(tokens: i64, last_refill: i64) -> Self {
        Self { tokens, last_refill }
    }

    /// A key the store has no record of.
    pub fn is_vacant(&self) -> bool {
        self.last_refill == 0
    }
}

/// The outcome of one take against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the cost was deducted
    pub admitted: bool,
    /// The state that was (or is to be) persisted
    pub state: BucketState,
}

impl Decision {
    /// Tokens left in the bucket after this decision.
    pub fn remaining(&self) -> i64 {
        self.state.tokens
    }
}

/// Refill rate and capacity shared by every key of an engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    rate: f64,
    capacity: i64,
}

impl Policy {
    /// Create a policy.
    ///
    /// A rate of zero is accepted and yields a bucket that never refills.
    pub fn new(rate: f64, capacity: i64) -> Result<Self> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(TollgateError::InvalidArgument(format!(
                "rate must be a finite, non-negative number of tokens per second, got {}",
                rate
            )));
        }
        if capacity <= 0 {
            return Err(TollgateError::InvalidArgument(format!(
                "capacity must be positive, got {}",
                capacity
            )));
        }
        Ok(Self { rate, capacity })
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum tokens a bucket may hold.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Reject non-positive costs.
    pub fn check_cost(&self, cost: i64) -> Result<()> {
        if cost <= 0 {
            return Err(TollgateError::InvalidArgument(format!(
                "cost must be positive, got {}",
                cost
            )));
        }
        Ok(())
    }

    /// Reject clock readings at or before the epoch.
    ///
    /// A zero timestamp would be persisted as the vacant marker and a negative
    /// one would poison the key, so neither may reach [`Policy::apply`].
    pub fn check_now(&self, now: i64) -> Result<()> {
        if now <= 0 {
            return Err(TollgateError::InvalidArgument(format!(
                "clock reading must be after the Unix epoch, got {} ns",
                now
            )));
        }
        Ok(())
    }

    /// Whether a cost can ever be admitted under this policy.
    pub fn is_satisfiable(&self, cost: i64) -> bool {
        cost <= self.capacity
    }

    /// Check a state read back from storage.
    ///
    /// Vacant records are not checked: their token count is meaningless.
    pub fn check_state(&self, key: &str, state: &BucketState) -> Result<()> {
        if state.is_vacant() {
            return Ok(());
        }
        if state.tokens < 0 || state.tokens > self.capacity || state.last_refill < 0 {
            return Err(TollgateError::InvalidState {
                key: key.to_string(),
                tokens: state.tokens,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Bring a bucket up to date with `now`.
    ///
    /// Only whole tokens are added. When none are due the timestamp is kept,
    /// so the fractional time accumulates across calls. A clock reading at or
    /// before `last_refill` adds nothing.
    pub fn refill(&self, state: BucketState, now: i64) -> BucketState {
        let mut state = if state.is_vacant() {
            BucketState::new(self.capacity, now)
        } else {
            state
        };

        let elapsed = now.saturating_sub(state.last_refill).max(0);
        let refill = (elapsed as f64 / NANOS_PER_SEC * self.rate).floor();
        if refill >= 1.0 {
            // float-to-int `as` saturates
            state.tokens = state.tokens.saturating_add(refill as i64).min(self.capacity);
            state.last_refill = now;
        }
        state
    }

    /// Refill, then deduct `cost` if enough tokens are available.
    ///
    /// The returned state must be persisted whether or not the cost was
    /// admitted.
    pub fn apply(&self, state: BucketState, now: i64, cost: i64) -> Decision {
        let mut state = self.refill(state, now);
        let admitted = state.tokens >= cost;
        if admitted {
            state.tokens -= cost;
        }
        Decision { admitted, state }
    }

    /// How long until `cost` could be admitted from a bucket holding `tokens`.
    ///
    /// `None` means never: the bucket does not refill or is too small.
    pub fn retry_after(&self, cost: i64, tokens: i64) -> Option<Duration> {
        if !self.is_satisfiable(cost) {
            return None;
        }
        let deficit = cost.saturating_sub(tokens);
        if deficit <= 0 {
            return Some(Duration::ZERO);
        }
        if self.rate == 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(deficit as f64 / self.rate).ok()
    }
}
