//! Unified error types for the EVSE controller firmware.
//!
//! A single `Error` enum that every subsystem converts into.  All variants
//! are `Copy` so they can be passed through the comm loop, the safety
//! supervisor and the diagnostics counters without allocation.
//!
//! Most of these never escape the data plane: decode and lock errors are
//! counted and dropped, bus errors trigger recovery.  Only `Init` and
//! `Config` are allowed to abort boot.

use core::fmt;

use crate::can::BusId;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A received frame could not be mapped to a typed message.
    Decode(DecodeError),
    /// The shared state lock could not be taken in time.
    Lock(LockError),
    /// A CAN controller reported a fault.
    Bus(BusError),
    /// A peer (BMS or charger module) went silent.
    Peer(PeerError),
    /// A safety interlock was violated.
    Safety(SafetyFault),
    /// Peripheral initialisation failed.
    Init(&'static str),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::Lock(e) => write!(f, "lock: {e}"),
            Self::Bus(e) => write!(f, "bus: {e}"),
            Self::Peer(e) => write!(f, "peer: {e}"),
            Self::Safety(e) => write!(f, "safety: {e}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Decode errors
// ---------------------------------------------------------------------------

/// Reasons a frame is rejected by the dialect decoders.
///
/// None of these are faults: the frame is dropped and the value will be
/// re-polled on the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Arbitration ID not handled on this bus.
    UnknownId(u32),
    /// Standard (11-bit) frame where an extended one is required.
    NotExtended,
    /// Payload shorter than the schema's minimum.
    TooShort { need: u8, got: u8 },
    /// Group response with a function code outside the group.
    UnknownFunction(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownId(id) => write!(f, "unknown id 0x{id:08X}"),
            Self::NotExtended => write!(f, "standard frame where extended expected"),
            Self::TooShort { need, got } => write!(f, "frame too short ({got} < {need})"),
            Self::UnknownFunction(func) => write!(f, "unknown function code 0x{func:02X}"),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Bounded wait elapsed without acquiring the lock.
    Timeout,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "lock acquisition timed out"),
        }
    }
}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

// ---------------------------------------------------------------------------
// Bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The controller did not accept the frame (queue full, arbitration lost).
    TransmitFailed(BusId),
    /// The controller is in bus-off and must be reinitialised.
    BusOff(BusId),
    /// The driver is not installed or not started.
    NotStarted(BusId),
    /// Low-level driver error code.
    Driver(BusId, i32),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransmitFailed(bus) => write!(f, "{bus}: transmit failed"),
            Self::BusOff(bus) => write!(f, "{bus}: bus-off"),
            Self::NotStarted(bus) => write!(f, "{bus}: driver not started"),
            Self::Driver(bus, code) => write!(f, "{bus}: driver error {code}"),
        }
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

// ---------------------------------------------------------------------------
// Peer errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    /// No BMS frame within the silence window.
    BmsSilent,
    /// Charger module failed the freshness quorum.
    ChargerOffline,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BmsSilent => write!(f, "BMS silent"),
            Self::ChargerOffline => write!(f, "charger module offline"),
        }
    }
}

impl From<PeerError> for Error {
    fn from(e: PeerError) -> Self {
        Self::Peer(e)
    }
}

// ---------------------------------------------------------------------------
// Safety faults
// ---------------------------------------------------------------------------

/// Safety faults are accumulated in a bitfield by the
/// [`SafetySupervisor`](crate::safety::SafetySupervisor) so that several
/// can be active at once and cleared individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SafetyFault {
    /// BMS byte 4 reports charging not permitted.
    BmsUnsafe = 0b0000_0001,
    /// Charger module failed the 2-of-3 freshness quorum.
    ChargerOffline = 0b0000_0010,
    /// Charger bus controller in bus-off or stopped.
    ChargerBusOff = 0b0000_0100,
    /// BMS bus controller in bus-off or stopped.
    BmsBusOff = 0b0000_1000,
    /// Charger module reports temperature above the limit.
    OverTemperature = 0b0001_0000,
    /// No BMS activity within the feedback timeout.
    BmsSilent = 0b0010_0000,
}

impl SafetyFault {
    /// Return the bitmask for this fault.
    pub const fn mask(self) -> u8 {
        self as u8
    }

    /// Faults that keep the gate closed for as long as they are active.
    pub const GATE_BLOCKING: u8 = Self::ChargerOffline.mask()
        | Self::ChargerBusOff.mask()
        | Self::BmsBusOff.mask();
}

impl fmt::Display for SafetyFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BmsUnsafe => write!(f, "BMS does not permit charging"),
            Self::ChargerOffline => write!(f, "charger module offline"),
            Self::ChargerBusOff => write!(f, "charger bus off"),
            Self::BmsBusOff => write!(f, "BMS bus off"),
            Self::OverTemperature => write!(f, "charger over temperature"),
            Self::BmsSilent => write!(f, "BMS silent"),
        }
    }
}

impl From<SafetyFault> for Error {
    fn from(e: SafetyFault) -> Self {
        Self::Safety(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_masks_are_distinct() {
        let all = [
            SafetyFault::BmsUnsafe,
            SafetyFault::ChargerOffline,
            SafetyFault::ChargerBusOff,
            SafetyFault::BmsBusOff,
            SafetyFault::OverTemperature,
            SafetyFault::BmsSilent,
        ];
        let mut seen = 0u8;
        for fault in all {
            assert_eq!(seen & fault.mask(), 0, "{fault} overlaps");
            seen |= fault.mask();
        }
    }

    #[test]
    fn gate_blocking_excludes_advisory_faults() {
        assert_eq!(SafetyFault::GATE_BLOCKING & SafetyFault::OverTemperature.mask(), 0);
        assert_eq!(SafetyFault::GATE_BLOCKING & SafetyFault::BmsSilent.mask(), 0);
        assert_ne!(SafetyFault::GATE_BLOCKING & SafetyFault::ChargerOffline.mask(), 0);
    }

    #[test]
    fn display_includes_bus() {
        let e: Error = BusError::BusOff(BusId::Charger).into();
        assert_eq!(e.to_string(), "bus: charger bus: bus-off");
    }
}
