//! Port traits — the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ AppService / BackendBridge (domain)
//! ```
//!
//! Driven adapters (CAN controllers, the OCPP client, event sinks,
//! storage) implement these traits.  The domain consumes them via
//! generics, so the gate and decoder never touch hardware directly.
//!
//! ## Safety notes
//!
//! - **CanBusPort** implementations MUST NOT block longer than one frame
//!   time on transmit; a full queue is a `TransmitFailed`, not a wait.
//! - **BackendPort** implementations MUST NOT block: they are called from
//!   the comm thread with the gate already closed.
//! - **ConfigPort** implementations MUST validate before persisting.

use core::fmt;

use heapless::String;

use crate::can::{BusId, BusState, CanFrame};
use crate::config::SystemConfig;
use crate::connectivity::DisconnectCause;
use crate::error::BusError;
use crate::gate::{StopReason, TransactionId};

// ───────────────────────────────────────────────────────────────
// CAN bus port (driven adapter: domain ↔ CAN controllers)
// ───────────────────────────────────────────────────────────────

/// Transmit side and controller status of both buses.
///
/// Receiving is not part of this port: receiver threads push straight
/// into the per-bus [`FrameRing`](crate::can::FrameRing).
pub trait CanBusPort {
    /// Queue one frame for transmission.
    fn transmit(&mut self, bus: BusId, frame: &CanFrame) -> Result<(), BusError>;

    /// Current controller state.
    fn bus_state(&mut self, bus: BusId) -> BusState;

    /// Full stop / reinstall / start cycle.
    fn reinitialize(&mut self, bus: BusId) -> Result<(), BusError>;
}

// ───────────────────────────────────────────────────────────────
// Backend port (driven adapter: comm thread → charge point backend)
// ───────────────────────────────────────────────────────────────

/// Length of an OCPP idTag.
pub const ID_TAG_LEN: usize = 20;

pub type IdTag = String<ID_TAG_LEN>;

/// Vendor-specific alert sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    BmsUnsafe,
    EvDisconnected(DisconnectCause),
    ChargerOffline,
    BusOff(BusId),
}

impl Alert {
    /// DataTransfer messageId.
    pub const fn message_id(&self) -> &'static str {
        match self {
            Self::BmsUnsafe => "BmsUnsafe",
            Self::EvDisconnected(_) => "EvDisconnected",
            Self::ChargerOffline => "ChargerOffline",
            Self::BusOff(_) => "CanBusOff",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BmsUnsafe => write!(f, "BMS does not permit charging"),
            Self::EvDisconnected(cause) => write!(f, "EV disconnected: {cause}"),
            Self::ChargerOffline => write!(f, "charger module offline"),
            Self::BusOff(bus) => write!(f, "{bus} off"),
        }
    }
}

/// Outward calls the comm thread makes.  Fire-and-forget.
pub trait BackendPort {
    fn send_alert(&mut self, alert: Alert);

    /// Ask the backend to end the running transaction.
    fn request_stop(&mut self, reason: StopReason);

    /// Ask the backend to begin a transaction for a local start.
    fn request_start(&mut self, id_tag: &str);

    /// Raise (`true`) or clear the connector fault status.
    fn notify_fault(&mut self, faulted: bool);
}

/// A [`BackendPort`] call, queued for the protocol task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRequest {
    Alert(Alert),
    Stop(StopReason),
    Start(IdTag),
    Fault(bool),
}

// ───────────────────────────────────────────────────────────────
// Backend client (driven adapter: protocol task ↔ OCPP library)
// ───────────────────────────────────────────────────────────────

/// Notifications from the backend, consumed by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendNotification {
    RemoteStartRequested(IdTag),
    TransactionStarted(TransactionId),
    RemoteStopRequested,
    TransactionStopped,
}

/// OCPP sampled-value measurands the station reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurand {
    SoC,
    CurrentOffered,
    Temperature,
    Voltage,
    CurrentImport,
}

impl Measurand {
    pub const ALL: [Measurand; 5] = [
        Self::SoC,
        Self::CurrentOffered,
        Self::Temperature,
        Self::Voltage,
        Self::CurrentImport,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SoC => "SoC",
            Self::CurrentOffered => "Current.Offered",
            Self::Temperature => "Temperature",
            Self::Voltage => "Voltage",
            Self::CurrentImport => "Current.Import",
        }
    }
}

/// Station readings the OCPP library samples.  Implementations answer
/// from a pre-taken snapshot and never block.
pub trait EvseReadings {
    fn plugged(&self) -> bool;
    fn evse_ready(&self) -> bool;
    fn ev_ready(&self) -> bool;
    /// Energy register, whole Wh.
    fn energy_wh(&self) -> u32;
    fn power_w(&self) -> f32;
    fn measurand(&self, m: Measurand) -> Option<f32>;
}

/// The OCPP library as seen by the protocol task.
pub trait BackendClient {
    /// Run the library's message pump once.
    fn poll(&mut self, readings: &dyn EvseReadings);

    /// Whether the backend currently authorizes charging.
    fn is_charging_authorized(&self) -> bool;

    /// Execute one queued outward request.
    fn deliver(&mut self, request: BackendRequest);

    /// Answer the pending remote-start request.
    fn respond_remote_start(&mut self, accepted: bool);

    fn take_notification(&mut self) -> Option<BackendNotification>;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`AppEvent`](super::events::AppEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::AppEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Loads and persists system configuration.
///
/// Implementations MUST run [`SystemConfig::validate`] before persisting.
/// Invalid ranges are rejected with [`ConfigError::ValidationFailed`],
/// never clamped: a widened voltage band or a zero silence timeout would
/// let the gate stay open on an unplugged connector.
pub trait ConfigPort {
    /// Load configuration from persistent storage.
    /// Returns [`SystemConfig::default()`] if no stored config exists.
    fn load(&self) -> Result<SystemConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&self, config: &SystemConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// No config found in storage (first boot).
    NotFound,
    /// Stored config failed integrity / deserialization check.
    Corrupted,
    /// A config field failed range validation.
    ValidationFailed(&'static str),
    /// Underlying storage is full.
    StorageFull,
    /// Generic I/O error from the storage backend.
    IoError,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::StorageFull => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl From<crate::error::Error> for ConfigError {
    fn from(e: crate::error::Error) -> Self {
        match e {
            crate::error::Error::Config(msg) => Self::ValidationFailed(msg),
            _ => Self::IoError,
        }
    }
}
