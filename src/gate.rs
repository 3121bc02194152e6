//! Charging gate.
//!
//! The single authority over the charger output enable.  Four inputs are
//! set independently by different threads; the decision is recomputed
//! from all of them, read under one lock, every time it is needed.
//!
//! | Input        | Set by                               | Cleared by                         |
//! |--------------|--------------------------------------|------------------------------------|
//! | `authorized` | backend transaction-started          | any close                          |
//! | `hw_enabled` | backend transaction-started, console | any close                          |
//! | `tx_active`  | backend transaction-started          | backend transaction-stopped        |
//! | `bms_safe`   | BMS limits frame                     | BMS limits frame                   |
//!
//! Connectivity and the gate-blocking safety faults are folded in at
//! read time.

use core::fmt;

use crate::can::BusId;
use crate::config::SystemConfig;
use crate::connectivity::{ConnectivityState, DisconnectCause};
use crate::error::SafetyFault;

/// OCPP transaction identifier.  Metadata only, never an authorization.
pub type TransactionId = i32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateInputs {
    pub hw_enabled: bool,
    pub tx_active: bool,
    pub authorized: bool,
    pub bms_safe: bool,
}

/// Which optional conditions the gate enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    pub requires_bms_permit: bool,
    pub requires_connectivity: bool,
}

impl GatePolicy {
    pub fn from_config(cfg: &SystemConfig) -> Self {
        Self {
            requires_bms_permit: cfg.gate_requires_bms_permit,
            requires_connectivity: cfg.gate_requires_connectivity,
        }
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            requires_bms_permit: true,
            requires_connectivity: true,
        }
    }
}

/// Consistent snapshot of everything the decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateView {
    pub inputs: GateInputs,
    pub connected: bool,
    pub interlocks: u8,
    pub transaction_id: Option<TransactionId>,
}

impl GateView {
    pub fn is_open(&self, policy: GatePolicy) -> bool {
        self.inputs.authorized
            && self.inputs.hw_enabled
            && (!policy.requires_bms_permit || self.inputs.bms_safe)
            && (!policy.requires_connectivity || self.connected)
            && self.interlocks & SafetyFault::GATE_BLOCKING == 0
    }
}

/// Gate state held in the shared store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargingGate {
    pub inputs: GateInputs,
    pub transaction_id: Option<TransactionId>,
    /// Active safety fault mask, mirrored from the supervisor.
    pub interlocks: u8,
}

impl ChargingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self, connectivity: &ConnectivityState) -> GateView {
        GateView {
            inputs: self.inputs,
            connected: connectivity.is_connected(),
            interlocks: self.interlocks,
            transaction_id: self.transaction_id,
        }
    }

    /// Backend accepted a transaction.
    pub fn transaction_started(&mut self, id: TransactionId) {
        self.inputs.tx_active = true;
        self.inputs.authorized = true;
        self.inputs.hw_enabled = true;
        self.transaction_id = Some(id);
    }

    /// Backend ended the transaction.
    pub fn transaction_stopped(&mut self) {
        self.close();
        self.inputs.tx_active = false;
    }

    /// Local operator start.  Authorization still has to come from the
    /// backend.
    pub fn operator_enable(&mut self) {
        self.inputs.hw_enabled = true;
    }

    /// Clear enable, authorization and the transaction id together.
    /// `tx_active` stays set until the backend confirms the stop.
    /// Returns the transaction id that was active, if any.
    pub fn close(&mut self) -> Option<TransactionId> {
        self.inputs.hw_enabled = false;
        self.inputs.authorized = false;
        self.transaction_id.take()
    }
}

// ── Close / stop reasons ──────────────────────────────────────

/// Why the gate was forced closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    BackendStop,
    EvDisconnected(DisconnectCause),
    BmsUnsafe,
    ChargerOffline,
    BusOff(BusId),
    EmergencyStop,
}

impl CloseReason {
    /// Stop request the backend should receive, if any.
    pub fn stop_reason(self) -> Option<StopReason> {
        match self {
            Self::BackendStop => None,
            Self::EvDisconnected(_) => Some(StopReason::EvDisconnected),
            Self::BmsUnsafe => Some(StopReason::EmergencyStop),
            Self::ChargerOffline | Self::BusOff(_) => Some(StopReason::Other),
            Self::EmergencyStop => Some(StopReason::Local),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackendStop => write!(f, "backend stop"),
            Self::EvDisconnected(cause) => write!(f, "EV disconnected ({cause})"),
            Self::BmsUnsafe => write!(f, "BMS unsafe"),
            Self::ChargerOffline => write!(f, "charger offline"),
            Self::BusOff(bus) => write!(f, "{bus} down"),
            Self::EmergencyStop => write!(f, "emergency stop"),
        }
    }
}

/// OCPP 1.6 StopTransaction reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EvDisconnected,
    EmergencyStop,
    Local,
    Other,
}

impl StopReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EvDisconnected => "EVDisconnected",
            Self::EmergencyStop => "EmergencyStop",
            Self::Local => "Local",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
