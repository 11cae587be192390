//! Retry, circuit breaking, and timeouts for outbound calls.
//!
//! Every call to the embedder, the chat LLM, and the vector store flows
//! through an [`OutboundPolicy`]: a per-call timeout, an exponential backoff
//! with full jitter for transient failures, and a circuit breaker that opens
//! when half of a rolling window fails. Classification is owned by
//! [`ArchrevError::is_transient`]; nothing here inspects messages.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::core::config::ResilienceConfig;
use crate::core::errors::{ArchrevError, Result};

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    factor: f64,
    cap: Duration,
}

impl RetryPolicy {
    /// Build from configuration.
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base: Duration::from_millis(config.backoff_base_ms),
            factor: config.backoff_factor,
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// Maximum attempts including the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_millis(jittered as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    opened_at: Option<Instant>,
    samples: VecDeque<(Instant, bool)>,
}

/// Rolling-window circuit breaker.
///
/// Opens when the failure ratio over the sampling window reaches the
/// configured threshold with at least `min_throughput` samples; stays open
/// for the break duration; then admits a single half-open probe.
pub struct CircuitBreaker {
    failure_ratio: f64,
    min_throughput: usize,
    sampling_window: Duration,
    break_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Build from configuration.
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            failure_ratio: config.breaker_failure_ratio,
            min_throughput: config.breaker_min_throughput,
            sampling_window: Duration::from_secs(config.breaker_sampling_window_seconds),
            break_duration: Duration::from_secs(config.breaker_break_duration_seconds),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                opened_at: None,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Admit or refuse a call. Refusals are transient so the retry layer and
    /// the bus treat them like any other temporary outage.
    pub fn check(&self, label: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let opened = inner.opened_at.unwrap_or_else(Instant::now);
                if opened.elapsed() >= self.break_duration {
                    inner.state = BreakerState::HalfOpen;
                    debug!("circuit for {label} half-open, admitting probe");
                    Ok(())
                } else {
                    Err(ArchrevError::transient(
                        "Circuit.Open",
                        format!("circuit for {label} is open"),
                    ))
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, label: &str, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::HalfOpen => {
                if success {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                    inner.samples.clear();
                    debug!("circuit for {label} closed after successful probe");
                } else {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    warn!("circuit for {label} re-opened after failed probe");
                }
                return;
            }
            BreakerState::Open => return,
            BreakerState::Closed => {}
        }

        inner.samples.push_back((now, success));
        while let Some((at, _)) = inner.samples.front() {
            if now.duration_since(*at) > self.sampling_window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }

        let total = inner.samples.len();
        if total < self.min_throughput {
            return;
        }
        let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
        if failures as f64 / total as f64 >= self.failure_ratio {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(
                "circuit for {label} opened: {failures}/{total} failures in window"
            );
        }
    }
}

/// Combined retry + breaker + timeout wrapper for one outbound service.
pub struct OutboundPolicy {
    label: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl OutboundPolicy {
    /// Build a policy for one service.
    pub fn new(label: impl Into<String>, config: &ResilienceConfig, call_timeout: Duration) -> Self {
        Self {
            label: label.into(),
            retry: RetryPolicy::from_config(config),
            breaker: Arc::new(CircuitBreaker::from_config(config)),
            call_timeout,
        }
    }

    /// Run `op`, retrying transient failures with backoff, refusing while the
    /// circuit is open, and bounding each attempt by the per-call timeout.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.breaker.check(&self.label)?;

            let outcome = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ArchrevError::transient(
                    format!("{}.Timeout", self.label),
                    format!(
                        "{} call exceeded {}s",
                        self.label,
                        self.call_timeout.as_secs()
                    ),
                )),
            };

            match outcome {
                Ok(value) => {
                    self.breaker.record(&self.label, true);
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.record(&self.label, false);
                    if !err.is_transient() || attempt > self.retry.max_attempts() {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        "{} attempt {attempt} failed ({err}); retrying in {:?}",
                        self.label, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> ResilienceConfig {
        ResilienceConfig::default()
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy::from_config(&config());
        for attempt in 1..12 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= Duration::from_millis(15_000));
        }
    }

    #[test]
    fn test_breaker_opens_on_failure_ratio() {
        let breaker = CircuitBreaker::from_config(&config());
        for _ in 0..5 {
            breaker.record("svc", true);
        }
        for _ in 0..6 {
            breaker.record("svc", false);
        }
        assert!(breaker.check("svc").is_err());
    }

    #[test]
    fn test_breaker_requires_min_throughput() {
        let breaker = CircuitBreaker::from_config(&config());
        for _ in 0..5 {
            breaker.record("svc", false);
        }
        // Five samples is below the ten-sample minimum.
        assert!(breaker.check("svc").is_ok());
    }

    #[tokio::test]
    async fn test_execute_retries_transient_errors() {
        let mut cfg = config();
        cfg.backoff_base_ms = 1;
        cfg.backoff_cap_ms = 2;
        let policy = OutboundPolicy::new("svc", &cfg, Duration::from_secs(5));

        let calls = AtomicU32::new(0);
        let result: Result<u32> = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ArchrevError::transient("svc.Unavailable", "flaky"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_does_not_retry_terminal_errors() {
        let mut cfg = config();
        cfg.backoff_base_ms = 1;
        let policy = OutboundPolicy::new("svc", &cfg, Duration::from_secs(5));

        let calls = AtomicU32::new(0);
        let result: Result<u32> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ArchrevError::validation("svc.Rejected", "bad input")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_times_out_slow_calls() {
        let mut cfg = config();
        cfg.max_retry_attempts = 0;
        let policy = OutboundPolicy::new("svc", &cfg, Duration::from_millis(20));

        let result: Result<u32> = policy
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(1)
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.error_code(), "svc.Timeout");
    }
}
