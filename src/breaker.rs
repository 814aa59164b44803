//! Circuit breaker guarding calls to the audit store
//!
//! The breaker is an explicit state machine (`Closed | Open { until } |
//! HalfOpen`) driven by two pure functions on [`BreakerState`]:
//! [`admit`](BreakerState::admit) decides whether a call may run and
//! [`transition`](BreakerState::transition) folds a call outcome into the
//! next state. [`CircuitBreakerPolicy`] wraps them with a single mutex that
//! is never held across the guarded call.

use crate::error::{AuditError, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::mem;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker and backoff settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub max_retries: u32,
    /// Base of the exponential backoff
    pub initial_delay: Duration,
    /// Cap on the exponential part of the backoff
    pub max_delay: Duration,
    /// Upper bound of the random delay added on top
    pub jitter: Duration,
    /// Deadline for a single guarded call
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        crate::config::AuditConfig::default().breaker()
    }
}

/// Current mode of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast until the cool-down expires
    Open { until: Instant },
    /// A single probe call is in flight
    HalfOpen,
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn same_mode(&self, other: &CircuitState) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

/// Result of a guarded call as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Admission decision for a new call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call in the closed state
    Allow,
    /// The one recovery probe after a cool-down
    Probe,
    /// Fail fast without touching the store
    Reject { retry_after: Duration },
}

/// Identifies the admission an outcome belongs to
///
/// `generation` is the breaker generation at admission time; it advances
/// every time the breaker opens, so outcomes of calls admitted before an
/// open are recognisably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub probe: bool,
    pub generation: u64,
}

/// Breaker state plus its consecutive-failure counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerState {
    pub circuit: CircuitState,
    pub failures: u32,
    pub generation: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            circuit: CircuitState::Closed,
            failures: 0,
            generation: 0,
        }
    }
}

impl BreakerState {
    /// Decide whether a call may run at `now`
    ///
    /// An expired `Open` becomes `HalfOpen` and admits exactly this caller
    /// as the probe; everyone else is rejected until the probe reports.
    pub fn admit(self, now: Instant) -> (Self, Admission) {
        match self.circuit {
            CircuitState::Closed => (self, Admission::Allow),
            CircuitState::Open { until } if now >= until => (
                Self {
                    circuit: CircuitState::HalfOpen,
                    ..self
                },
                Admission::Probe,
            ),
            CircuitState::Open { until } => (
                self,
                Admission::Reject {
                    retry_after: until - now,
                },
            ),
            CircuitState::HalfOpen => (
                self,
                Admission::Reject {
                    retry_after: Duration::ZERO,
                },
            ),
        }
    }

    /// Ticket handed to a call admitted from this state
    pub fn ticket(&self, admission: Admission) -> Ticket {
        Ticket {
            probe: admission == Admission::Probe,
            generation: self.generation,
        }
    }

    /// Fold a call outcome into the next state
    ///
    /// Only the probe's own outcome resolves `HalfOpen`; outcomes from an
    /// earlier generation are ignored. `jitter` is sampled by the caller so
    /// the function stays deterministic.
    pub fn transition(
        self,
        outcome: Outcome,
        ticket: Ticket,
        now: Instant,
        config: &BreakerConfig,
        jitter: Duration,
    ) -> Self {
        if ticket.generation != self.generation {
            return self;
        }

        match (self.circuit, ticket.probe, outcome) {
            (CircuitState::Closed, false, Outcome::Success) => Self {
                failures: 0,
                ..self
            },
            (CircuitState::Closed, false, Outcome::Failure) => {
                let failures = self.failures.saturating_add(1);
                if failures >= config.max_retries {
                    self.opened(failures, now, config, jitter)
                } else {
                    Self { failures, ..self }
                }
            }
            (CircuitState::HalfOpen, true, Outcome::Success) => Self {
                circuit: CircuitState::Closed,
                failures: 0,
                ..self
            },
            (CircuitState::HalfOpen, true, Outcome::Failure) => {
                self.opened(self.failures.saturating_add(1), now, config, jitter)
            }
            _ => self,
        }
    }

    fn opened(self, failures: u32, now: Instant, config: &BreakerConfig, jitter: Duration) -> Self {
        let delay = exponential_delay(config.initial_delay, config.max_delay, failures) + jitter;
        Self {
            circuit: CircuitState::Open { until: now + delay },
            failures,
            generation: self.generation.wrapping_add(1),
        }
    }
}

/// `min(max, initial * 2^exponent)`, saturating at `max` on overflow
pub fn exponential_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    2u32.checked_pow(exponent)
        .and_then(|factor| initial.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

type TransitionHook = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Thread-safe circuit breaker with timeout-bounded execution
pub struct CircuitBreakerPolicy {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreakerPolicy {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
            on_transition: None,
        }
    }

    /// Register a callback invoked (outside the lock) on every mode change
    pub fn with_transition_hook(
        mut self,
        hook: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_transition = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }

    pub fn snapshot(&self) -> BreakerState {
        *self.state.lock()
    }

    /// Backoff for the given attempt number, jitter included
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential_delay(self.config.initial_delay, self.config.max_delay, attempt)
            + self.sample_jitter()
    }

    /// Run `operation` if the breaker admits it
    ///
    /// Rejected calls return [`AuditError::CircuitOpen`] without invoking
    /// `operation`. Admitted calls are bounded by `call_timeout`; any error,
    /// including the timeout, counts as a failure.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;

        let result = match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(AuditError::Timeout(format!(
                "store call exceeded {}ms",
                self.config.call_timeout.as_millis()
            ))),
        };

        permit.complete(if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        });
        result
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let (from, to, admission, ticket) = {
            let mut state = self.state.lock();
            let from = state.circuit;
            let (next, admission) = state.admit(Instant::now());
            *state = next;
            (from, next.circuit, admission, next.ticket(admission))
        };
        self.report(from, to);

        match admission {
            Admission::Allow | Admission::Probe => Ok(Permit {
                policy: self,
                ticket,
                completed: false,
            }),
            Admission::Reject { retry_after } => Err(AuditError::CircuitOpen { retry_after }),
        }
    }

    fn record(&self, outcome: Outcome, ticket: Ticket) {
        let jitter = self.sample_jitter();
        let (from, to) = {
            let mut state = self.state.lock();
            let from = state.circuit;
            *state = state.transition(outcome, ticket, Instant::now(), &self.config, jitter);
            (from, state.circuit)
        };
        self.report(from, to);
    }

    fn report(&self, from: CircuitState, to: CircuitState) {
        if from.same_mode(&to) {
            return;
        }

        match to {
            CircuitState::Open { until } => tracing::warn!(
                from = from.name(),
                cooldown_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Audit store circuit opened"
            ),
            _ => tracing::info!(from = from.name(), to = to.name(), "Audit store circuit transition"),
        }

        if let Some(ref hook) = self.on_transition {
            hook(from, to);
        }
    }

    fn sample_jitter(&self) -> Duration {
        let max = self.config.jitter.as_nanos() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..=max))
    }
}

/// Admission token; an abandoned call counts as a failure
struct Permit<'a> {
    policy: &'a CircuitBreakerPolicy,
    ticket: Ticket,
    completed: bool,
}

impl Permit<'_> {
    fn complete(mut self, outcome: Outcome) {
        self.completed = true;
        self.policy.record(outcome, self.ticket);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.policy.record(Outcome::Failure, self.ticket);
        }
    }
}
