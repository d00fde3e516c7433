//! Per-terminal lockout for verification attempts.
//!
//! Kiosk terminals identify themselves with a caller-supplied client id.
//! Deliberate negative outcomes (no match, liveness rejection) fill a
//! sliding window of failure timestamps; once the window fills, the
//! terminal is locked out. Engine and sensor errors never reach the
//! limiter, so a flaky camera cannot lock a terminal out on its own.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Lockout thresholds, sourced from daemon config.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    /// Failures inside `window` that trigger a lockout.
    pub max_failures: usize,
    /// Sliding window over which failures are counted.
    pub window: Duration,
    /// How long a locked terminal stays locked.
    pub lockout: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(300),
        }
    }
}

/// How a verification attempt ended, as far as lockout accounting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A registered identity matched. Clears the terminal's failures.
    Matched,
    /// A face was seen but nobody matched.
    NoMatch,
    /// Depth liveness (or a caller-supplied verdict) rejected the attempt.
    LivenessRejected,
}

#[derive(Error, Debug)]
#[error("too many failed attempts; try again in {}s", .remaining.as_secs())]
pub struct LockedOut {
    pub remaining: Duration,
}

#[derive(Default)]
struct TerminalState {
    recent_failures: Vec<Instant>,
    locked_until: Option<Instant>,
}

/// Tracks failed verification attempts per kiosk terminal.
pub struct RateLimiter {
    policy: LockoutPolicy,
    terminals: HashMap<String, TerminalState>,
}

impl RateLimiter {
    pub fn new(policy: LockoutPolicy) -> Self {
        Self {
            policy,
            terminals: HashMap::new(),
        }
    }

    /// `Ok(())` when this terminal may attempt a verification right now.
    pub fn check(&mut self, terminal: &str) -> Result<(), LockedOut> {
        let now = Instant::now();
        let Some(state) = self.terminals.get_mut(terminal) else {
            return Ok(());
        };
        if let Some(until) = state.locked_until {
            if now < until {
                return Err(LockedOut {
                    remaining: until.duration_since(now),
                });
            }
            // Lockout expired; the terminal starts clean.
            state.locked_until = None;
            state.recent_failures.clear();
        }
        Ok(())
    }

    /// Fold an attempt's outcome into the terminal's window. A lockout
    /// begins the moment the window fills.
    pub fn record(&mut self, terminal: &str, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Matched => {
                self.terminals.remove(terminal);
            }
            AttemptOutcome::NoMatch | AttemptOutcome::LivenessRejected => {
                let now = Instant::now();
                let window = self.policy.window;
                let state = self.terminals.entry(terminal.to_string()).or_default();
                state
                    .recent_failures
                    .retain(|t| now.duration_since(*t) < window);
                state.recent_failures.push(now);

                if state.recent_failures.len() >= self.policy.max_failures {
                    state.locked_until = Some(now + self.policy.lockout);
                    tracing::warn!(
                        terminal,
                        ?outcome,
                        failures = state.recent_failures.len(),
                        lockout_secs = self.policy.lockout.as_secs(),
                        "failure window full, locking terminal"
                    );
                } else {
                    tracing::debug!(
                        terminal,
                        ?outcome,
                        failures = state.recent_failures.len(),
                        max = self.policy.max_failures,
                        "counting failed attempt"
                    );
                }
            }
        }
    }
}
