//! Circuit breaker: classifies iteration outcomes and latches a halting
//! state when the loop looks unhealthy.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{AnalysisResult, Status};

pub const DEFAULT_STAGNATION_THRESHOLD: u32 = 3;
pub const DEFAULT_SAME_ERROR_THRESHOLD: u32 = 5;
pub const DEFAULT_OUTPUT_DECLINE_THRESHOLD: u32 = 70;
pub const DEFAULT_MAX_CONSECUTIVE_TEST_LOOPS: u32 = 3;
pub const DEFAULT_COMPLETION_THRESHOLD: u32 = 2;
pub const DEFAULT_SAFETY_COMPLETION_THRESHOLD: u32 = 5;

/// Output-decline strikes before the circuit trips.
const DECLINE_STRIKES: u32 = 2;

/// Trip thresholds for the breaker. Zero values fall back to the defaults
/// at construction time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitThresholds {
    /// Consecutive no-progress (or status-less) loops before tripping.
    pub stagnation: u32,
    /// Consecutive identical error signatures before tripping.
    pub same_error: u32,
    /// Output shrink percentage that counts as a decline strike.
    pub output_decline: u32,
    /// Consecutive test-only loops before tripping.
    pub max_consecutive_test_loops: u32,
    /// Completion phrases required alongside the exit signal.
    pub completion: u32,
    /// Consecutive completion-sounding loops without an exit signal before
    /// tripping.
    pub safety_completion: u32,
}

impl Default for CircuitThresholds {
    fn default() -> Self {
        Self {
            stagnation: DEFAULT_STAGNATION_THRESHOLD,
            same_error: DEFAULT_SAME_ERROR_THRESHOLD,
            output_decline: DEFAULT_OUTPUT_DECLINE_THRESHOLD,
            max_consecutive_test_loops: DEFAULT_MAX_CONSECUTIVE_TEST_LOOPS,
            completion: DEFAULT_COMPLETION_THRESHOLD,
            safety_completion: DEFAULT_SAFETY_COMPLETION_THRESHOLD,
        }
    }
}

impl CircuitThresholds {
    /// Replace unset (zero) values with the defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.stagnation == 0 {
            self.stagnation = defaults.stagnation;
        }
        if self.same_error == 0 {
            self.same_error = defaults.same_error;
        }
        if self.output_decline == 0 {
            self.output_decline = defaults.output_decline;
        }
        if self.max_consecutive_test_loops == 0 {
            self.max_consecutive_test_loops = defaults.max_consecutive_test_loops;
        }
        if self.completion == 0 {
            self.completion = defaults.completion;
        }
        if self.safety_completion == 0 {
            self.safety_completion = defaults.safety_completion;
        }
        self
    }
}

/// Full counter set, copyable in and out for persistence and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub no_progress_count: u32,
    pub same_error_count: u32,
    pub last_error_signature: String,
    pub decline_count: u32,
    pub last_output_size: usize,
    pub consecutive_test_loops: u32,
    pub consecutive_completion_count: u32,
    pub tripped: bool,
    pub trip_reason: String,
}

/// Outcome of one breaker evaluation.
#[derive(Debug, Clone, Default)]
pub struct CircuitDecision {
    pub tripped: bool,
    pub reason: String,
    pub is_complete: bool,
    pub completion_msg: String,
}

/// Multi-condition halting predicate evaluated once per iteration.
///
/// Once tripped the breaker latches: every later evaluation returns the same
/// tripped decision until [`CircuitBreaker::reset`].
pub struct CircuitBreaker {
    thresholds: CircuitThresholds,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(thresholds: CircuitThresholds) -> Self {
        Self {
            thresholds: thresholds.normalized(),
            inner: Mutex::new(CircuitBreakerState::default()),
        }
    }

    pub fn thresholds(&self) -> CircuitThresholds {
        self.thresholds
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.lock().tripped
    }

    pub fn trip_reason(&self) -> String {
        self.inner.lock().trip_reason.clone()
    }

    pub fn same_error_count(&self) -> u32 {
        self.inner.lock().same_error_count
    }

    pub fn last_error_signature(&self) -> String {
        self.inner.lock().last_error_signature.clone()
    }

    /// Copy of the full counter set.
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().clone()
    }

    /// Replace the counter set wholesale.
    pub fn restore_state(&self, state: CircuitBreakerState) {
        *self.inner.lock() = state;
    }

    /// Clear every counter and un-latch the breaker.
    pub fn reset(&self) {
        *self.inner.lock() = CircuitBreakerState::default();
        info!("circuit breaker reset");
    }

    /// Evaluate one iteration. `status` is the parsed status block (absent
    /// when the agent produced none); `analysis` is the analyzer output for
    /// the same iteration.
    pub fn update_with_analysis(
        &self,
        status: Option<&Status>,
        analysis: &AnalysisResult,
    ) -> CircuitDecision {
        let mut inner = self.inner.lock();

        // Latched: nothing left to evaluate.
        if inner.tripped {
            return CircuitDecision {
                tripped: true,
                reason: inner.trip_reason.clone(),
                ..Default::default()
            };
        }

        // Safety valve: the agent keeps sounding finished without ever
        // setting EXIT_SIGNAL. Usually a confused agent; halting beats
        // looping forever.
        match status {
            Some(s) if s.completion_indicators > 0 => {
                inner.consecutive_completion_count += 1;
                if inner.consecutive_completion_count >= self.thresholds.safety_completion {
                    let reason = format!(
                        "completion signals for {} consecutive loops without exit signal",
                        inner.consecutive_completion_count
                    );
                    return self.trip(&mut inner, reason);
                }
            }
            _ => inner.consecutive_completion_count = 0,
        }

        // Strict completion is a clean exit, not a trip.
        if let Some(s) = status {
            if s.exit_signal && s.completion_indicators >= self.thresholds.completion {
                return CircuitDecision {
                    is_complete: true,
                    completion_msg: format!(
                        "exit signal with {} completion indicators",
                        s.completion_indicators
                    ),
                    ..Default::default()
                };
            }
        }

        let Some(status) = status else {
            inner.no_progress_count += 1;
            if inner.no_progress_count >= self.thresholds.stagnation {
                let reason = format!(
                    "stagnation: no LOOP_STATUS block for {} consecutive loops",
                    inner.no_progress_count
                );
                return self.trip(&mut inner, reason);
            }
            return CircuitDecision::default();
        };

        if status.is_blocked() {
            let reason = format!("agent reported BLOCKED: {}", status.recommendation);
            return self.trip(&mut inner, reason);
        }

        if !analysis.error_signature.is_empty() {
            if analysis.error_signature == inner.last_error_signature {
                inner.same_error_count += 1;
                if inner.same_error_count >= self.thresholds.same_error {
                    let reason = format!("same error repeated {} times", inner.same_error_count);
                    return self.trip(&mut inner, reason);
                }
            } else {
                inner.same_error_count = 1;
                inner.last_error_signature = analysis.error_signature.clone();
            }
        } else {
            inner.same_error_count = 0;
            inner.last_error_signature.clear();
        }

        // Two consecutive big output drops usually mean the agent is
        // winding down into filler responses.
        if analysis.output_size > 0 && inner.last_output_size > 0 && self.thresholds.output_decline > 0
        {
            let last = inner.last_output_size as f64;
            let current = analysis.output_size as f64;
            let decline = (last - current) / last * 100.0;
            if decline >= self.thresholds.output_decline as f64 {
                inner.decline_count += 1;
                if inner.decline_count >= DECLINE_STRIKES {
                    let reason = format!(
                        "output declined >={}% for {} consecutive loops",
                        self.thresholds.output_decline, inner.decline_count
                    );
                    inner.last_output_size = analysis.output_size;
                    return self.trip(&mut inner, reason);
                }
            } else {
                inner.decline_count = 0;
            }
        }
        inner.last_output_size = analysis.output_size;

        if status.is_test_only() {
            inner.consecutive_test_loops += 1;
            if inner.consecutive_test_loops >= self.thresholds.max_consecutive_test_loops {
                let reason = format!(
                    "only test work for {} consecutive loops",
                    inner.consecutive_test_loops
                );
                return self.trip(&mut inner, reason);
            }
        } else {
            inner.consecutive_test_loops = 0;
        }

        if status.has_progress() {
            inner.no_progress_count = 0;
            return CircuitDecision::default();
        }

        inner.no_progress_count += 1;
        if inner.no_progress_count >= self.thresholds.stagnation {
            let reason = format!(
                "stagnation: no progress for {} consecutive loops",
                inner.no_progress_count
            );
            return self.trip(&mut inner, reason);
        }

        CircuitDecision::default()
    }

    fn trip(&self, inner: &mut CircuitBreakerState, reason: String) -> CircuitDecision {
        inner.tripped = true;
        inner.trip_reason = reason.clone();
        warn!("circuit breaker tripped: {}", reason);
        CircuitDecision {
            tripped: true,
            reason,
            ..Default::default()
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitThresholds::default())
    }
}
