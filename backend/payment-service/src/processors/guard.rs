/// Per-processor call guard: timeout plus circuit breaker
///
/// State transitions:
/// - Closed → Open: consecutive outage failures reach the threshold, or the
///   failure rate over the sliding window does
/// - Open → HalfOpen: after the open timeout
/// - HalfOpen → Closed: after enough successes
/// - HalfOpen → Open: on any outage failure
///
/// Declines and other business answers are successes from the breaker's
/// point of view; only timeouts and unavailability trip it.
use super::{
    AttachedMethod, ChargeOutcome, ProcessorAdapter, ProcessorError, ProcessorResult,
    RecurringRequest, RecurringUpdate,
};
use crate::domain::{PaymentMethod, PaymentMethodKind, Transaction, WebhookEnvelope};
use crate::metrics;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on any single processor call
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// Probing whether the processor recovered
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count to trigger circuit open
    pub failure_threshold: u32,
    /// Success count in HalfOpen to close circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub open_timeout: Duration,
    /// Error rate threshold (0.0 - 1.0) to trigger circuit open
    pub error_rate_threshold: f64,
    /// Sliding window size for error rate calculation
    pub window_size: usize,
    /// Calls needed in the window before the error rate is considered
    pub min_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            error_rate_threshold: 0.5,
            window_size: 50,
            min_calls: 10,
        }
    }
}

struct BreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// true = success, false = failure
    window: VecDeque<bool>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(BreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                window: VecDeque::with_capacity(config.window_size),
            })),
            config,
        }
    }

    /// Whether a call may proceed; moves Open → HalfOpen once the timeout elapsed
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.write();

        match state.current {
            CircuitState::Open => match state.opened_at {
                Some(opened_at) if opened_at.elapsed() >= self.config.open_timeout => {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    state.consecutive_successes = 0;
                    state.consecutive_failures = 0;
                    true
                }
                _ => false,
            },
            CircuitState::HalfOpen | CircuitState::Closed => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write();

        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        self.push_window(&mut state, true);

        if state.current == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut state, CircuitState::Closed);
            state.window.clear();
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.write();

        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        self.push_window(&mut state, false);

        match state.current {
            CircuitState::Closed => {
                let error_rate = self.error_rate_of(&state);
                let rate_tripped = state.window.len() >= self.config.min_calls
                    && error_rate >= self.config.error_rate_threshold;

                if state.consecutive_failures >= self.config.failure_threshold || rate_tripped {
                    warn!(
                        processor = %self.name,
                        failures = state.consecutive_failures,
                        error_rate = format!("{:.2}%", error_rate * 100.0),
                        "Circuit breaker: Closed → Open"
                    );
                    self.transition(&mut state, CircuitState::Open);
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(processor = %self.name, "Circuit breaker: HalfOpen → Open (trial call failed)");
                self.transition(&mut state, CircuitState::Open);
                state.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.read().current
    }

    pub fn error_rate(&self) -> f64 {
        let state = self.state.read();
        self.error_rate_of(&state)
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        if state.current != to {
            info!(
                processor = %self.name,
                from = state.current.as_str(),
                to = to.as_str(),
                "Circuit breaker transition"
            );
            metrics::record_circuit_transition(&self.name, to.as_str());
            state.current = to;
        }
    }

    fn push_window(&self, state: &mut BreakerState, success: bool) {
        if state.window.len() >= self.config.window_size {
            state.window.pop_front();
        }
        state.window.push_back(success);
    }

    fn error_rate_of(&self, state: &BreakerState) -> f64 {
        if state.window.is_empty() {
            return 0.0;
        }
        let failures = state.window.iter().filter(|&&ok| !ok).count();
        failures as f64 / state.window.len() as f64
    }
}

/// A processor adapter behind its timeout and breaker
pub struct GuardedProcessor {
    adapter: Arc<dyn ProcessorAdapter>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl GuardedProcessor {
    pub fn new(
        adapter: Arc<dyn ProcessorAdapter>,
        timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let name = adapter.name().to_string();
        Self {
            breaker: CircuitBreaker::new(name, breaker),
            timeout: timeout.min(MAX_CALL_TIMEOUT),
            adapter,
        }
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> ProcessorResult<T>
    where
        F: Future<Output = ProcessorResult<T>>,
    {
        if !self.breaker.try_acquire() {
            metrics::observe_processor_call(self.name(), operation, "circuit_open", Duration::ZERO);
            return Err(ProcessorError::CircuitOpen(self.name().to_string()));
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Err(ProcessorError::Timeout(_))) | Err(_) => Err(ProcessorError::Timeout(self.timeout)),
            Ok(result) => result,
        };

        match &result {
            Err(e) if e.is_transient() => {
                warn!(
                    processor = %self.name(),
                    operation = operation,
                    error = %e,
                    "Processor call failed"
                );
                self.breaker.record_failure();
            }
            _ => self.breaker.record_success(),
        }

        let label = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::observe_processor_call(self.name(), operation, label, started.elapsed());
        result
    }

    pub async fn attach_payment_method(
        &self,
        user_id: Uuid,
        token: &str,
        kind: PaymentMethodKind,
    ) -> ProcessorResult<AttachedMethod> {
        self.guarded(
            "attach_payment_method",
            self.adapter.attach_payment_method(user_id, token, kind),
        )
        .await
    }

    pub async fn charge(
        &self,
        transaction: &Transaction,
        method: &PaymentMethod,
    ) -> ProcessorResult<ChargeOutcome> {
        self.guarded("charge", self.adapter.charge(transaction, method))
            .await
    }

    pub async fn refund(&self, transaction: &Transaction, reason: &str) -> ProcessorResult<()> {
        self.guarded("refund", self.adapter.refund(transaction, reason))
            .await
    }

    pub async fn detach_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()> {
        self.guarded(
            "detach_payment_method",
            self.adapter.detach_payment_method(method),
        )
        .await
    }

    pub async fn verify_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()> {
        self.guarded(
            "verify_payment_method",
            self.adapter.verify_payment_method(method),
        )
        .await
    }

    pub async fn create_recurring(&self, request: &RecurringRequest) -> ProcessorResult<String> {
        self.guarded("create_recurring", self.adapter.create_recurring(request))
            .await
    }

    pub async fn cancel_recurring(
        &self,
        processor_subscription_id: &str,
        immediate: bool,
    ) -> ProcessorResult<()> {
        self.guarded(
            "cancel_recurring",
            self.adapter
                .cancel_recurring(processor_subscription_id, immediate),
        )
        .await
    }

    pub async fn update_recurring(
        &self,
        processor_subscription_id: &str,
        update: &RecurringUpdate,
    ) -> ProcessorResult<()> {
        self.guarded(
            "update_recurring",
            self.adapter
                .update_recurring(processor_subscription_id, update),
        )
        .await
    }

    /// Local computation; not subject to the breaker
    pub fn decode_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ProcessorResult<WebhookEnvelope> {
        self.adapter.decode_webhook(payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test", config)
    }

    #[test]
    fn test_closed_to_open_on_consecutive_failures() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        for _ in 0..3 {
            assert!(cb.try_acquire());
            cb.record_failure();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[tokio::test]
    async fn test_open_to_half_open_after_timeout() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_successes() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        cb.record_failure();
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.try_acquire());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_failure() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            open_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        cb.record_failure();
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cb.try_acquire());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_error_rate_needs_minimum_calls() {
        let cb = breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            error_rate_threshold: 0.5,
            window_size: 10,
            min_calls: 10,
            ..Default::default()
        });

        // 4 failures out of 5: high rate but too few calls
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..4 {
            cb.record_success();
        }
        // 10 calls, 5 failures
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
