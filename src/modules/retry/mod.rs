//! Classified retry controller.
//!
//! Drives sequential attempts. A blocked attempt penalises its identity with
//! escalated severity and waits a short fixed delay, since the next attempt
//! already rotates to a different proxy. A transient failure counts as an
//! ordinary failure and backs off exponentially with jitter. Once attempts
//! run out the last error is returned unchanged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::blocking::{AttemptOutcome, ProductPayload};
use crate::config::duration_ms;
use crate::modules::events::{
    AttemptEvent, BlockedEvent, EventDispatcher, RetryEvent, ScraperEvent,
};
use crate::modules::proxy::{FailureSeverity, Identity, IdentityRegistry};
use crate::modules::timing::exponential_backoff;
use crate::scraper::ScrapeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause after a blocked attempt. Kept below `backoff_base`.
    #[serde(with = "duration_ms")]
    pub blocked_delay: Duration,
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    #[serde(with = "duration_ms")]
    pub backoff_ceiling: Duration,
    /// Fraction of the backoff used as jitter span.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            blocked_delay: Duration::from_millis(500),
            backoff_base: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(10),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    fn transient_delay(&self, attempt: u32) -> Duration {
        exponential_backoff(self.backoff_base, attempt, self.backoff_ceiling, self.jitter)
    }
}

/// What an attempt is told before it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Fresh identity for this attempt; `None` means go proxyless.
    pub identity: Option<Identity>,
}

pub struct RetryController {
    policy: RetryPolicy,
    registry: Arc<IdentityRegistry>,
    events: Arc<EventDispatcher>,
}

impl RetryController {
    pub fn new(
        policy: RetryPolicy,
        registry: Arc<IdentityRegistry>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            policy,
            registry,
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `attempt_fn` up to `max_attempts` times (at least once).
    pub async fn execute<F, Fut>(
        &self,
        target: &str,
        max_attempts: u32,
        mut attempt_fn: F,
    ) -> Result<ProductPayload, ScrapeError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let max_attempts = max_attempts.max(1);
        let mut previous: Option<Identity> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let identity = self.registry.select_healthy_except(previous.as_ref());
            let proxy = identity.as_ref().map(Identity::endpoint);

            self.events.dispatch(ScraperEvent::Attempt(AttemptEvent {
                target: target.to_string(),
                attempt,
                max_attempts,
                proxy: proxy.clone(),
                timestamp: Utc::now(),
            }));

            let outcome = attempt_fn(AttemptContext {
                attempt,
                max_attempts,
                identity: identity.clone(),
            })
            .await;

            let (error, delay) = match outcome {
                AttemptOutcome::Success(payload) => {
                    if let Some(identity) = &identity {
                        self.registry.report_success(identity);
                    }
                    return Ok(payload);
                }
                AttemptOutcome::Blocked(reason) => {
                    if let Some(identity) = &identity {
                        self.registry.report_failure(identity, reason.into());
                    }
                    self.events.dispatch(ScraperEvent::Blocked(BlockedEvent {
                        target: target.to_string(),
                        reason,
                        proxy,
                        timestamp: Utc::now(),
                    }));
                    (
                        ScrapeError::Blocked {
                            reason,
                            attempts: attempt,
                        },
                        self.policy.blocked_delay,
                    )
                }
                AttemptOutcome::Transient(failure) => {
                    if let Some(identity) = &identity {
                        self.registry
                            .report_failure(identity, FailureSeverity::Ordinary);
                    }
                    (
                        ScrapeError::Transient {
                            cause: failure.cause,
                            message: failure.message,
                            attempts: attempt,
                        },
                        self.policy.transient_delay(attempt),
                    )
                }
            };

            if attempt >= max_attempts {
                log::warn!("giving up on {target} after {attempt} attempts: {error}");
                return Err(error);
            }

            self.events.dispatch(ScraperEvent::Retry(RetryEvent {
                target: target.to_string(),
                attempt: attempt + 1,
                reason: error.error_tag().to_string(),
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));

            if delay > Duration::ZERO {
                sleep(delay).await;
            }
            previous = identity;
        }
    }
}
