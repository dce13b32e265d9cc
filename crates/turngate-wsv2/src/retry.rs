//! Retry / Fallback Policy (C8), per §4.8: error classification, backoff
//! schedule, and a per-account circuit breaker.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use crate::error::{ErrorClass, WsError};

pub const DEFAULT_BASE: Duration = Duration::from_millis(200);
pub const DEFAULT_CAP: Duration = Duration::from_secs(2);
pub const DEFAULT_JITTER_RATIO: f64 = 0.3;
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_ratio: f64,
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_retries: MAX_RETRIES,
        }
    }
}

/// `wait = min(cap, base * 2^n) * (1 +/- jitter_ratio)`.
pub fn backoff_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt);
    let unjittered = config.base.saturating_mul(exp).min(config.cap);
    let jitter_span = unjittered.as_secs_f64() * config.jitter_ratio;
    let jitter = rand::rng().random_range(-jitter_span..=jitter_span);
    Duration::from_secs_f64((unjittered.as_secs_f64() + jitter).max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    HttpFallback,
    TerminalClose,
    ReturnVerbatim,
}

/// Decides what to do after a failed WS attempt, given the attempt count
/// so far and whether the original client ingress was HTTP.
pub fn decide(
    error: &WsError,
    attempts_so_far: u32,
    config: &BackoffConfig,
    original_ingress_was_http: bool,
) -> RecoveryAction {
    match error.class() {
        ErrorClass::Retryable if attempts_so_far < config.max_retries => RecoveryAction::Retry,
        ErrorClass::Retryable => {
            if original_ingress_was_http {
                RecoveryAction::HttpFallback
            } else {
                RecoveryAction::TerminalClose
            }
        }
        ErrorClass::NonRetryable => {
            if matches!(error, WsError::UpstreamPolicyClose { .. }) && original_ingress_was_http {
                RecoveryAction::HttpFallback
            } else {
                RecoveryAction::ReturnVerbatim
            }
        }
        ErrorClass::Terminal => RecoveryAction::ReturnVerbatim,
    }
}

/// Failure ratio over the last `window_size` attempts per account; when
/// open, WS is bypassed for a cooldown window even if mode says ws (§4.8).
pub struct CircuitBreaker {
    window_size: usize,
    cooldown: Duration,
    open_threshold: f64,
    min_samples: usize,
    accounts: RwLock<HashMap<i64, AccountWindow>>,
}

struct AccountWindow {
    samples: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl Default for AccountWindow {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Closed,
    Open,
    HalfOpenProbe,
}

impl CircuitBreaker {
    pub fn new(window_size: usize, cooldown: Duration, open_threshold: f64, min_samples: usize) -> Self {
        Self {
            window_size,
            cooldown,
            open_threshold,
            min_samples,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(20, Duration::from_secs(30), 0.5, 5)
    }

    pub async fn record(&self, account_id: i64, success: bool) {
        let mut guard = self.accounts.write().await;
        let state = guard.entry(account_id).or_default();
        let now = Instant::now();
        state.samples.push_back(success);
        while state.samples.len() > self.window_size {
            state.samples.pop_front();
        }
        if success {
            if state.half_open_probe_in_flight {
                state.opened_at = None;
                state.half_open_probe_in_flight = false;
                state.samples.clear();
            }
        } else if state.opened_at.is_none() {
            let total = state.samples.len();
            let failures = state.samples.iter().filter(|ok| !ok).count();
            if total >= self.min_samples && failures as f64 / total as f64 >= self.open_threshold {
                state.opened_at = Some(now);
            }
        } else if state.half_open_probe_in_flight {
            // Probe failed: stay open, restart cooldown.
            state.opened_at = Some(now);
            state.half_open_probe_in_flight = false;
        }
    }

    pub async fn check(&self, account_id: i64) -> BreakerDecision {
        let mut guard = self.accounts.write().await;
        let state = guard.entry(account_id).or_default();
        let Some(opened_at) = state.opened_at else {
            return BreakerDecision::Closed;
        };
        if Instant::now().duration_since(opened_at) < self.cooldown {
            return BreakerDecision::Open;
        }
        if state.half_open_probe_in_flight {
            return BreakerDecision::Open;
        }
        state.half_open_probe_in_flight = true;
        BreakerDecision::HalfOpenProbe
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_cap_and_grows_exponentially() {
        let config = BackoffConfig::default();
        let w0 = backoff_for_attempt(&config, 0);
        let w3 = backoff_for_attempt(&config, 3);
        assert!(w0 <= Duration::from_millis(260));
        assert!(w3 <= config.cap + Duration::from_millis(1));
    }

    #[test]
    fn retryable_error_retries_until_max_attempts_then_falls_back_on_http() {
        let config = BackoffConfig::default();
        let error = WsError::UpstreamReadTimeout;
        assert_eq!(decide(&error, 0, &config, true), RecoveryAction::Retry);
        assert_eq!(decide(&error, 2, &config, true), RecoveryAction::Retry);
        assert_eq!(decide(&error, 3, &config, true), RecoveryAction::HttpFallback);
        assert_eq!(decide(&error, 3, &config, false), RecoveryAction::TerminalClose);
    }

    #[test]
    fn policy_close_falls_back_on_http_ingress_only() {
        let config = BackoffConfig::default();
        let error = WsError::UpstreamPolicyClose { code: 1008, reason: "blocked".to_string() };
        assert_eq!(decide(&error, 0, &config, true), RecoveryAction::HttpFallback);
        assert_eq!(decide(&error, 0, &config, false), RecoveryAction::ReturnVerbatim);
    }

    #[test]
    fn auth_error_always_returns_verbatim() {
        let config = BackoffConfig::default();
        let error = WsError::UpstreamAuthError("bad token".to_string());
        assert_eq!(decide(&error, 0, &config, true), RecoveryAction::ReturnVerbatim);
    }

    #[tokio::test]
    async fn breaker_opens_after_failure_ratio_exceeds_threshold() {
        let breaker = CircuitBreaker::new(20, Duration::from_millis(50), 0.5, 4);
        for _ in 0..4 {
            breaker.record(1, false).await;
        }
        assert_eq!(breaker.check(1).await, BreakerDecision::Open);
    }

    #[tokio::test]
    async fn breaker_half_opens_after_cooldown_and_closes_on_success() {
        let breaker = CircuitBreaker::new(20, Duration::from_millis(10), 0.5, 2);
        breaker.record(1, false).await;
        breaker.record(1, false).await;
        assert_eq!(breaker.check(1).await, BreakerDecision::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.check(1).await, BreakerDecision::HalfOpenProbe);
        breaker.record(1, true).await;
        assert_eq!(breaker.check(1).await, BreakerDecision::Closed);
    }

    #[tokio::test]
    async fn breaker_window_caps_sample_count_at_twenty() {
        // Window is the last 20 attempts (a ring buffer), not a time-based
        // sliding window — pushing more than 20 samples with no elapsed
        // time still evicts the oldest ones.
        let breaker = CircuitBreaker::new(20, Duration::from_secs(30), 0.5, 5);
        for _ in 0..30 {
            breaker.record(1, true).await;
        }
        let guard = breaker.accounts.read().await;
        let state = guard.get(&1).unwrap();
        assert_eq!(state.samples.len(), 20);
    }
}
