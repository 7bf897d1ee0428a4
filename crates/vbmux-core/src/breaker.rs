//! Circuit breaker: per-connection health state with canary probing.
//!
//! Mirrors the gauge-exposing state machines in
//! `kimberlite-vsr::instrumentation` (internal state plus a plain
//! accessor for tests/observability) but the state transitions
//! themselves follow spec.md §4.2's three-state breaker with an
//! injected canary sender rather than anything in the teacher repo,
//! since the teacher has no client-side circuit breaker of its own.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// The breaker's three states (spec §3 "Circuit Breaker").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected; a canary probe is in flight or pending.
    Open,
    /// A canary succeeded; the next real request is let through as a
    /// trial before fully closing.
    HalfOpen,
}

/// Tunables for [`CircuitBreaker`]. Defaults follow a conservative
/// "a handful of consecutive failures opens it" policy; callers wire
/// these from connection-level configuration.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub canary_timeout: Duration,
    pub rolling_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            canary_timeout: Duration::from_secs(5),
            rolling_window: Duration::from_secs(60),
        }
    }
}

/// Per-pipeline-client circuit breaker.
///
/// `AllowsRequest`/`MarkSuccessful`/`MarkFailure`/`CompletionCallback`/
/// `Reset`/`CanaryTimeout` from spec §3 map onto
/// [`Self::allows_request`], [`Self::mark_successful`],
/// [`Self::mark_failure`], [`Self::completion_outcome`], [`Self::reset`],
/// [`Self::canary_timeout`].
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    consecutive_failures: AtomicU32,
    canary_in_flight: Mutex<bool>,
    generation: AtomicU64,
}

/// Whether a completed send should be folded into the breaker's
/// success/failure accounting. Some terminal errors (e.g. a cancelled
/// request) are not the connection's fault and must not move the
/// breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success,
    Failure,
    Ignore,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            canary_in_flight: Mutex::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(BreakerConfig {
            enabled: false,
            ..BreakerConfig::default()
        })
    }

    pub fn state(&self) -> BreakerState {
        *self.state.lock()
    }

    pub fn canary_timeout(&self) -> Duration {
        self.config.canary_timeout
    }

    /// `AllowsRequest()`. A disabled breaker always allows. An open
    /// breaker allows at most one canary at a time and nothing else;
    /// half-open allows a single trial request through.
    pub fn allows_request(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let state = *self.state.lock();
        match state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        }
    }

    /// `MarkSuccessful()`. Clears the failure count and, from
    /// half-open, fully closes the breaker.
    pub fn mark_successful(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let mut state = self.state.lock();
        if matches!(*state, BreakerState::HalfOpen | BreakerState::Open) {
            tracing::debug!("circuit breaker closing after success");
        }
        *state = BreakerState::Closed;
    }

    /// `MarkFailure()`. From half-open, a single failure reopens; from
    /// closed, the breaker opens once `failure_threshold` consecutive
    /// failures accumulate.
    pub fn mark_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.state.lock();
        match *state {
            BreakerState::HalfOpen => {
                *state = BreakerState::Open;
                self.generation.fetch_add(1, Ordering::AcqRel);
            }
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    *state = BreakerState::Open;
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    tracing::warn!(failures, "circuit breaker opening");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// `CompletionCallback(err) -> bool`: decides whether a finished
    /// send should feed the breaker, then applies it. Returns `true`
    /// when the outcome was counted as a success, matching spec's
    /// "true = count as success".
    pub fn completion_callback(&self, outcome: CompletionOutcome) -> bool {
        match outcome {
            CompletionOutcome::Success => {
                self.mark_successful();
                true
            }
            CompletionOutcome::Failure => {
                self.mark_failure();
                false
            }
            CompletionOutcome::Ignore => self.state() != BreakerState::Open,
        }
    }

    /// `Reset()`. Called at the top of the pipeline client's outer
    /// `Run` loop (spec §4.2 step 2) before each fresh dial attempt.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        *self.state.lock() = BreakerState::Closed;
    }

    /// Transitions `Open -> HalfOpen` so the next `allows_request` lets
    /// one trial through; called when a canary succeeds within its
    /// timeout (spec §4.2 "Canary").
    pub fn canary_succeeded(&self) {
        let mut state = self.state.lock();
        if *state == BreakerState::Open {
            *state = BreakerState::HalfOpen;
        }
    }

    /// Marks a canary failure (including the timeout path). Exactly
    /// one of `canary_succeeded`/`canary_failed` is called per canary
    /// attempt by the pipeline client, resolving spec §9's "canary path
    /// double-marks failure on the timeout branch" open question: the
    /// timeout future and the completion future race via `select!`, so
    /// only the winning branch ever calls either of these.
    pub fn canary_failed(&self) {
        let state = *self.state.lock();
        if state == BreakerState::Open {
            tracing::debug!("circuit breaker canary failed, remaining open");
        }
    }

    /// Begins a canary attempt, returning `false` if one is already in
    /// flight (at most one canary outstanding at a time per spec's
    /// "emits a canary ... via an injected sender").
    pub fn try_begin_canary(&self) -> bool {
        let mut in_flight = self.canary_in_flight.lock();
        if *in_flight {
            return false;
        }
        *in_flight = true;
        true
    }

    pub fn end_canary(&self) {
        *self.canary_in_flight.lock() = false;
    }
}
