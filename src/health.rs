//! Charger module health quorum.
//!
//! Three periodic frames are watched: terminal power, terminal status and
//! heartbeat.  The module is healthy while at least `health_quorum` of
//! them arrived within `health_timeout_ms`, so losing one message type
//! alone never reports offline.

use core::fmt;

use crate::config::SystemConfig;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthState {
    /// Not yet assessed.
    #[default]
    Unknown,
    Healthy,
    Offline,
}

impl HealthState {
    pub fn is_healthy(self) -> bool {
        self == Self::Healthy
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Number of watched frames that are fresh at `now_ms`.
pub fn fresh_count(t: &Telemetry, cfg: &SystemConfig, now_ms: u64) -> u8 {
    let window = cfg.health_timeout_ms;
    u8::from(t.terminal.is_fresh(now_ms, window))
        + u8::from(t.terminal_status.is_fresh(now_ms, window))
        + u8::from(t.heartbeat_alive.is_fresh(now_ms, window))
}

pub fn assess(t: &Telemetry, cfg: &SystemConfig, now_ms: u64) -> HealthState {
    if fresh_count(t, cfg, now_ms) >= cfg.health_quorum {
        HealthState::Healthy
    } else {
        HealthState::Offline
    }
}

/// A change of assessed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: HealthState,
    pub to: HealthState,
}

impl HealthTransition {
    /// Entering offline from any other state raises the fault.
    pub fn raises_fault(&self) -> bool {
        self.to == HealthState::Offline
    }

    /// Only a recovery from offline clears it.  Re-opening the gate is
    /// never automatic.
    pub fn clears_fault(&self) -> bool {
        self.from == HealthState::Offline && self.to == HealthState::Healthy
    }
}

/// Record a new assessment, returning the transition if it changed.
pub fn transition(current: &mut HealthState, next: HealthState) -> Option<HealthTransition> {
    if *current == next {
        return None;
    }
    let t = HealthTransition {
        from: *current,
        to: next,
    };
    *current = next;
    Some(t)
}
