//! Retry policy interface and the default exponential backoff.
//!
//! Workers hand every failure to a [`RetryPolicy`] and act on the returned
//! [`Decision`]. The default policy is pure; richer classifiers (remote
//! services included) plug in behind the same trait and are bounded by a
//! hard timeout, falling back to the default decision when they overrun.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use evsnow_connectors::error::{ConnectorError, ErrorKind};

use crate::config::RetryConfig;

/// What to do about a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Sleep, then retry the same batch against the same channel.
    RetryAfter(Duration),
    /// Stop retrying; surfaces like [`Decision::Fatal`] but is logged as an
    /// exhausted budget rather than an unrecoverable error.
    GiveUp,
    /// Unrecoverable; stop the worker immediately.
    Fatal,
}

/// Classifies failures into retry decisions.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Decides what to do after `attempt` failed attempts (1-based) over
    /// `elapsed` wall-clock time.
    async fn classify(&self, error: &ConnectorError, attempt: u32, elapsed: Duration) -> Decision;
}

/// Pure exponential backoff with a cap and an attempt budget.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    /// Creates the policy from its config.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff delay after `attempt` failures: `min(base * 2^(attempt-1), cap)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(32);
        let delay = self
            .config
            .base_delay
            .saturating_mul(2_u32.saturating_pow(doublings));
        delay.min(self.config.max_delay)
    }

    fn decide(&self, error: &ConnectorError, attempt: u32) -> Decision {
        match error.kind() {
            ErrorKind::Transient | ErrorKind::DurabilityTimeout | ErrorKind::CheckpointPersist => {
                if attempt >= self.config.max_attempts {
                    Decision::GiveUp
                } else {
                    Decision::RetryAfter(self.delay_for(attempt))
                }
            }
            ErrorKind::Permanent | ErrorKind::Configuration => Decision::Fatal,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoff {
    async fn classify(&self, error: &ConnectorError, attempt: u32, _elapsed: Duration) -> Decision {
        self.decide(error, attempt)
    }
}

/// Bounds an inner classifier with a hard timeout.
///
/// On timeout the default backoff decides instead, so a slow external
/// classifier can never stall the worker or block shutdown.
pub struct BoundedPolicy {
    inner: Arc<dyn RetryPolicy>,
    fallback: ExponentialBackoff,
    timeout: Duration,
}

impl BoundedPolicy {
    /// Wraps `inner`, falling back to `fallback` after `timeout`.
    #[must_use]
    pub fn new(inner: Arc<dyn RetryPolicy>, fallback: ExponentialBackoff, timeout: Duration) -> Self {
        Self {
            inner,
            fallback,
            timeout,
        }
    }
}

#[async_trait]
impl RetryPolicy for BoundedPolicy {
    async fn classify(&self, error: &ConnectorError, attempt: u32, elapsed: Duration) -> Decision {
        match tokio::time::timeout(self.timeout, self.inner.classify(error, attempt, elapsed)).await
        {
            Ok(decision) => decision,
            Err(_) => {
                warn!(
                    error = %error,
                    attempt,
                    "retry classifier overran its deadline, using default decision"
                );
                self.fallback.decide(error, attempt)
            }
        }
    }
}

/// Memoizes an expensive classifier's verdict per error kind.
///
/// Only kind-level verdicts are cached; `GiveUp` is attempt-dependent and
/// is never stored, so budget exhaustion still applies per incident.
pub struct CachingPolicy {
    inner: Arc<dyn RetryPolicy>,
    cache: Mutex<HashMap<ErrorKind, Decision>>,
}

impl CachingPolicy {
    /// Wraps `inner` with a per-kind decision cache.
    #[must_use]
    pub fn new(inner: Arc<dyn RetryPolicy>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RetryPolicy for CachingPolicy {
    async fn classify(&self, error: &ConnectorError, attempt: u32, elapsed: Duration) -> Decision {
        let kind = error.kind();
        if let Some(cached) = self.cache.lock().get(&kind) {
            return *cached;
        }
        let decision = self.inner.classify(error, attempt, elapsed).await;
        if decision != Decision::GiveUp {
            self.cache.lock().insert(kind, decision);
        }
        decision
    }
}
