use crate::error::{PlatformError, SyncError};
use crate::sync::config::GovernorConfig;
use crate::sync::warn::{self, WarnEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorPolicy {
    pub min_interval: Duration,
    pub max_attempts: u32,
    pub transient_base_delay: Duration,
    pub transient_max_delay: Duration,
}

impl From<&GovernorConfig> for GovernorPolicy {
    fn from(cfg: &GovernorConfig) -> Self {
        Self {
            min_interval: cfg.min_interval(),
            max_attempts: cfg.max_attempts.max(1),
            transient_base_delay: cfg.transient_base_delay(),
            transient_max_delay: cfg.transient_max_delay(),
        }
    }
}

impl GovernorPolicy {
    /// Delay before retry number `attempt` (1-based) of a transient failure.
    pub fn transient_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.transient_base_delay
            .saturating_mul(factor)
            .min(self.transient_max_delay)
    }
}

/// Spacing and backoff controller for remote calls.
///
/// Every call reserves a slot at least `min_interval` after the previous one.
/// Provider wait hints push the next slot out by the hinted duration. A
/// governor may be chained to a shared provider-wide parent: each call then
/// also waits for the parent's slot, and global rate limits defer the parent
/// so every task under the same credential pauses.
#[derive(Debug)]
pub struct RateGovernor {
    policy: GovernorPolicy,
    next_slot: Mutex<Instant>,
    parent: Option<Arc<RateGovernor>>,
}

impl RateGovernor {
    pub fn new(policy: GovernorPolicy) -> Self {
        Self {
            policy,
            next_slot: Mutex::new(Instant::now()),
            parent: None,
        }
    }

    /// Provider-wide governor. It carries global deferrals only; per-call
    /// spacing stays with the per-conversation children.
    pub fn provider(policy: GovernorPolicy) -> Arc<Self> {
        Arc::new(Self::new(GovernorPolicy {
            min_interval: Duration::ZERO,
            ..policy
        }))
    }

    pub fn child(parent: &Arc<RateGovernor>) -> Self {
        Self {
            policy: parent.policy,
            next_slot: Mutex::new(Instant::now()),
            parent: Some(Arc::clone(parent)),
        }
    }

    async fn reserve(&self) -> Instant {
        let mut slot = self.next_slot.lock().await;
        let at = (*slot).max(Instant::now());
        *slot = at + self.policy.min_interval;
        at
    }

    async fn acquire(&self) {
        let at = self.reserve().await;
        sleep_until(at).await;
        if let Some(parent) = &self.parent {
            let at = parent.reserve().await;
            sleep_until(at).await;
        }
    }

    /// Push the next available slot to at least `wait` from now.
    pub async fn defer(&self, wait: Duration) {
        let mut slot = self.next_slot.lock().await;
        let resume = Instant::now() + wait;
        if resume > *slot {
            *slot = resume;
        }
    }

    /// Run `call` under the governor, retrying recoverable failures within
    /// the attempt budget. `label` identifies the conversation in warnings.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.acquire().await;
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retry = format!("{attempt}/{}", self.policy.max_attempts);
            match err {
                PlatformError::RateLimited {
                    retry_after,
                    global,
                } => {
                    if attempt >= self.policy.max_attempts {
                        warn::emit(
                            WarnEvent::new("RATE_LIMIT_EXHAUSTED", "fetch", label)
                                .retry(&retry)
                                .reason("retry_budget_spent"),
                        );
                        return Err(SyncError::RateLimited {
                            attempts: attempt,
                            last_wait: retry_after,
                        });
                    }
                    warn::emit(
                        WarnEvent::new("RATE_LIMITED", "fetch", label)
                            .retry(&retry)
                            .reason(if global { "global" } else { "route" }),
                    );
                    tracing::debug!(
                        conversation = label,
                        wait_ms = retry_after.as_millis() as u64,
                        global,
                        "deferring after provider wait hint"
                    );
                    if global {
                        if let Some(parent) = &self.parent {
                            parent.defer(retry_after).await;
                        }
                    }
                    self.defer(retry_after).await;
                }
                PlatformError::Transient(message) => {
                    if attempt >= self.policy.max_attempts {
                        warn::emit(
                            WarnEvent::new("NETWORK_EXHAUSTED", "fetch", label)
                                .retry(&retry)
                                .err(&message),
                        );
                        return Err(SyncError::TransientNetwork {
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.policy.transient_delay(attempt);
                    tracing::debug!(
                        conversation = label,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "retrying transient failure"
                    );
                    self.defer(delay).await;
                }
                PlatformError::Auth(msg) => return Err(SyncError::Auth(msg)),
                PlatformError::NotFound(msg) => return Err(SyncError::NotFound(msg)),
                PlatformError::Protocol(msg) => return Err(SyncError::Protocol(msg)),
            }
        }
    }
}
