//! Outbound application events.
//!
//! The [`AppService`](super::service::AppService) emits these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them: log to serial, forward to the
//! backend as diagnostics, etc.

use crate::can::{BusId, BusState};
use crate::connectivity::{DisconnectCause, Evidence};
use crate::gate::{CloseReason, TransactionId};
use crate::health::HealthState;
use crate::soc::SocEstimate;

/// Structured events emitted by the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// Periodic telemetry snapshot.
    Telemetry(TelemetryData),

    /// The service has started.
    Started,

    /// Battery and gun asserted connected.
    Connected(Evidence),

    /// A disconnect rule fired.
    Disconnected(DisconnectCause),

    /// The gate decision changed to open.
    GateOpened { transaction_id: Option<TransactionId> },

    /// The gate was forced closed.
    GateClosed(CloseReason),

    /// Enable command written to the charger bus.
    EnableSent(bool),

    HealthChanged { from: HealthState, to: HealthState },

    /// One or more safety faults were raised.  Carries the full mask.
    FaultDetected(u8),

    /// All safety faults have been cleared.
    FaultCleared,

    SocUpdated(SocEstimate),

    BusDown { bus: BusId, state: BusState },

    BusRecovered(BusId),

    /// Periodic per-bus status.
    BusStatus(BusStatusData),

    /// Operator start rejected by local checks.
    StartRejected(&'static str),
}

/// A point-in-time telemetry snapshot suitable for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryData {
    pub gate_open: bool,
    pub battery_connected: bool,
    pub gun_connected: bool,
    pub bms_max_voltage: f32,
    pub bms_max_current: f32,
    pub bms_safe: bool,
    pub charger_voltage: f32,
    pub charger_current: f32,
    pub charger_temperature_c: f32,
    pub terminal_voltage: f32,
    pub terminal_current: f32,
    pub soc_percent: Option<f32>,
    pub energy_wh: f64,
    pub charger_health: HealthState,
    pub fault_flags: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStatusData {
    pub bus: BusId,
    pub state: BusState,
    pub ring_fill_percent: u8,
    pub received: u32,
    pub overwritten: u32,
    pub tx_failures: u32,
}
