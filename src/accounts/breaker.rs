//! Per-account circuit breaker. State lives on the persisted account
//! row, so every process in the fleet sees the same circuit.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::AccountPoolConfig;
use crate::domain::{Account, AccountStatus};
use crate::metrics::AccountPoolMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// What a recorded outcome did to the circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    None,
    Opened,
    Closed,
    Reopened,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    open_threshold: u32,
    half_open_after: Duration,
    half_open_successes_required: u32,
}

impl CircuitBreaker {
    pub fn new(config: &AccountPoolConfig) -> Self {
        Self {
            open_threshold: config.open_threshold,
            half_open_after: Duration::seconds(config.half_open_after_secs as i64),
            half_open_successes_required: config.half_open_successes_required,
        }
    }

    pub fn state(&self, account: &Account, now: DateTime<Utc>) -> CircuitState {
        if account.status != AccountStatus::CircuitOpen {
            return CircuitState::Closed;
        }
        match account.circuit_opened_at {
            Some(opened_at) if now >= opened_at + self.half_open_after => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    /// Whether the selector may route traffic here (closed, or probing)
    pub fn is_available(&self, account: &Account, now: DateTime<Utc>) -> bool {
        !account.is_disabled() && self.state(account, now) != CircuitState::Open
    }

    pub fn on_success(&self, account: &mut Account, now: DateTime<Utc>) -> CircuitTransition {
        account.last_success_at = Some(now);

        match self.state(account, now) {
            CircuitState::Closed => {
                account.consecutive_failures = 0;
                CircuitTransition::None
            }
            CircuitState::HalfOpen => {
                account.half_open_successes += 1;
                if account.half_open_successes >= self.half_open_successes_required {
                    account.status = AccountStatus::Active;
                    account.circuit_opened_at = None;
                    account.consecutive_failures = 0;
                    account.half_open_successes = 0;
                    AccountPoolMetrics::record_circuit_close();
                    info!(account_id = %account.id, "Circuit closed after successful probes");
                    CircuitTransition::Closed
                } else {
                    CircuitTransition::None
                }
            }
            CircuitState::Open => CircuitTransition::None,
        }
    }

    pub fn on_failure(
        &self,
        account: &mut Account,
        now: DateTime<Utc>,
        reason: &str,
    ) -> CircuitTransition {
        account.consecutive_failures += 1;
        account.last_failure_at = Some(now);
        account.last_failure_reason = Some(reason.to_string());

        match self.state(account, now) {
            CircuitState::Closed => {
                if account.consecutive_failures >= self.open_threshold {
                    account.status = AccountStatus::CircuitOpen;
                    account.circuit_opened_at = Some(now);
                    account.half_open_successes = 0;
                    AccountPoolMetrics::record_circuit_open();
                    warn!(
                        account_id = %account.id,
                        consecutive_failures = account.consecutive_failures,
                        reason,
                        "Circuit opened"
                    );
                    CircuitTransition::Opened
                } else {
                    CircuitTransition::None
                }
            }
            CircuitState::HalfOpen => {
                // A failed probe restarts the cool-down
                account.circuit_opened_at = Some(now);
                account.half_open_successes = 0;
                warn!(account_id = %account.id, reason, "Probe failed, circuit reopened");
                CircuitTransition::Reopened
            }
            CircuitState::Open => CircuitTransition::None,
        }
    }
}
