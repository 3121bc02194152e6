//! Shared state store.
//!
//! One `std::sync::Mutex` guards telemetry, connectivity, gate inputs,
//! charger health and the energy meter.  Every reader and writer goes
//! through [`SharedStore::with`], which waits at most `lock_timeout_ms`
//! and then gives up: the caller drops that one update and tries again
//! on its next natural tick.  Timeouts are counted, never retried inline.
//!
//! A poisoned lock is recovered, not propagated: a panic on another
//! thread must not take the gate down with it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::config::SystemConfig;
use crate::connectivity::{self, ConnectivityState, Evidence};
use crate::energy::EnergyMeter;
use crate::error::LockError;
use crate::gate::{ChargingGate, GateView};
use crate::health::HealthState;
use crate::protocol::Decoded;
use crate::telemetry::{Applied, Telemetry};

/// Poll interval while waiting for the lock.
const LOCK_POLL: Duration = Duration::from_millis(1);

/// Everything behind the lock.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    pub telemetry: Telemetry,
    pub connectivity: ConnectivityState,
    pub gate: ChargingGate,
    pub charger_health: HealthState,
    pub energy: EnergyMeter,
}

impl StoreState {
    pub fn gate_view(&self) -> GateView {
        self.gate.view(&self.connectivity)
    }
}

/// Result of applying one decoded frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecodeUpdate {
    pub applied: Applied,
    pub evidence: Option<Evidence>,
    /// Connectivity went from false to true on this frame.
    pub newly_connected: bool,
}

pub struct SharedStore {
    state: Mutex<StoreState>,
    lock_timeout: Duration,
    lock_timeouts: AtomicU32,
}

impl SharedStore {
    pub fn new(lock_timeout_ms: u32) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            lock_timeout: Duration::from_millis(u64::from(lock_timeout_ms)),
            lock_timeouts: AtomicU32::new(0),
        }
    }

    pub fn from_config(cfg: &SystemConfig) -> Self {
        Self::new(cfg.lock_timeout_ms)
    }

    /// Run `f` under the lock, waiting at most the configured timeout.
    pub fn with<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> Result<R, LockError> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.state.try_lock() {
                Ok(mut guard) => return Ok(f(&mut guard)),
                Err(TryLockError::Poisoned(poisoned)) => {
                    log::warn!("store lock poisoned, recovering");
                    self.state.clear_poison();
                    return Ok(f(&mut poisoned.into_inner()));
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(LockError::Timeout);
                    }
                    std::thread::sleep(LOCK_POLL);
                }
            }
        }
    }

    /// Bounded-wait snapshot of the gate inputs.
    pub fn gate_view(&self) -> Result<GateView, LockError> {
        self.with(|s| s.gate_view())
    }

    /// Apply a decoded frame and its connection evidence in one critical
    /// section.
    pub fn apply_decoded(
        &self,
        decoded: &Decoded,
        now_ms: u64,
        cfg: &SystemConfig,
    ) -> Result<DecodeUpdate, LockError> {
        self.with(|s| {
            let applied = s.telemetry.apply(decoded, now_ms, &cfg.capacity);
            if let Decoded::Bms(limits) = decoded {
                s.gate.inputs.bms_safe = limits.safe_to_charge;
                s.connectivity.note_bms_activity(now_ms);
            }
            let evidence = connectivity::connect_evidence(decoded, cfg);
            let was_connected = s.connectivity.is_connected();
            if evidence.is_some() {
                s.connectivity.mark_connected(now_ms);
            }
            DecodeUpdate {
                applied,
                evidence,
                newly_connected: !was_connected && s.connectivity.is_connected(),
            }
        })
    }

    /// Lock acquisitions that timed out.
    pub fn lock_timeouts(&self) -> u32 {
        self.lock_timeouts.load(Ordering::Relaxed)
    }
}
