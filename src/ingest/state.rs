// src/ingest/state.rs
//! Per-feed fetch bookkeeping and its two transitions. Pure: no I/O, time is passed in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ingest::types::FeedId;

/// Exponential backoff: `base * multiplier^(errors-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub multiplier: f64,
    pub max_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 60,
            multiplier: 2.0,
            max_secs: 3600,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "backoff.base_secs",
                reason: "must be > 0".into(),
            });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidSetting {
                field: "backoff.multiplier",
                reason: format!("must be >= 1.0, got {}", self.multiplier),
            });
        }
        if self.max_secs < self.base_secs {
            return Err(ConfigError::InvalidSetting {
                field: "backoff.max_secs",
                reason: "must be >= backoff.base_secs".into(),
            });
        }
        Ok(())
    }

    /// Delay after the `error_count`-th consecutive failure (1-based).
    pub fn delay_for(&self, error_count: u32) -> Duration {
        let exp = error_count.saturating_sub(1).min(63) as i32;
        let secs = self.base_secs as f64 * self.multiplier.powi(exp);
        let capped = if secs.is_finite() {
            secs.min(self.max_secs as f64)
        } else {
            self.max_secs as f64
        };
        Duration::milliseconds((capped * 1000.0).round() as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// No outstanding errors.
    Healthy,
    /// Failing, backoff deadline still in the future.
    Degraded,
    /// Failing, but the backoff deadline has passed.
    Recoverable,
}

/// Invariant: `error_count == 0` exactly when `backoff_until` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedState {
    pub feed_id: FeedId,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// HTTP status of the last attempt, 0 when no response arrived.
    pub last_status: u16,
    pub error_count: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl FeedState {
    pub fn initial(feed_id: FeedId) -> Self {
        Self {
            feed_id,
            etag: None,
            last_modified: None,
            last_status: 0,
            error_count: 0,
            backoff_until: None,
            fetched_at: None,
        }
    }

    /// Any 2xx or 304: store validators, clear the error streak.
    pub fn with_successful_fetch(
        self,
        etag: Option<String>,
        last_modified: Option<String>,
        status: u16,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            etag,
            last_modified,
            last_status: status,
            error_count: 0,
            backoff_until: None,
            fetched_at: Some(now),
            ..self
        }
    }

    /// Record one more failure. `backoff` overrides the policy delay but never exceeds its cap.
    pub fn with_failed_fetch(
        self,
        status: u16,
        backoff: Option<Duration>,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let error_count = self.error_count.saturating_add(1);
        let cap = Duration::seconds(policy.max_secs as i64);
        let delay = match backoff {
            Some(d) => d.max(Duration::zero()).min(cap),
            None => policy.delay_for(error_count),
        };
        Self {
            last_status: status,
            error_count,
            backoff_until: Some(now + delay),
            fetched_at: Some(now),
            ..self
        }
    }

    pub fn is_in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    pub fn backoff_remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.backoff_until {
            Some(until) if until > now => until - now,
            _ => Duration::zero(),
        }
    }

    pub fn health(&self, now: DateTime<Utc>) -> Health {
        if self.error_count == 0 {
            Health::Healthy
        } else if self.is_in_backoff(now) {
            Health::Degraded
        } else {
            Health::Recoverable
        }
    }

    /// True when a feed polled every `interval` should be fetched again.
    pub fn is_due(&self, interval: std::time::Duration, now: DateTime<Utc>) -> bool {
        match self.fetched_at {
            None => true,
            Some(at) => {
                let interval =
                    Duration::from_std(interval).unwrap_or_else(|_| Duration::days(36_500));
                now - at >= interval
            }
        }
    }
}
