//! Typed CAN dialects.
//!
//! Every frame is validated length-first, then mapped onto a typed
//! reading.  Nothing here touches shared state: the caller applies a
//! [`Decoded`] value to the telemetry store under its own lock.
//!
//! ```text
//!  CanFrame ──▶ Decoder::decode(bus, frame) ──▶ Decoded ──▶ Telemetry::apply
//!                     │
//!                     ├─ charger bus: control / telemetry groups, terminal, heartbeat
//!                     └─ BMS bus:     limits, charge Ah, discharge Ah
//! ```

pub mod bms;
pub mod charger;

use crate::can::{ids, BusId, CanFrame, EXT_ID_MASK};
use crate::config::ChargerCurrentScale;
use crate::error::DecodeError;

use bms::BmsLimits;
use charger::{ControlReading, TelemetryReading, TerminalPower, TerminalStatus};

// ── Byte helpers ──────────────────────────────────────────────

/// Extended-format check first, then length.  Returns the valid payload.
pub(crate) fn require(frame: &CanFrame, min_len: u8) -> Result<&[u8], DecodeError> {
    if !frame.is_extended() {
        return Err(DecodeError::NotExtended);
    }
    if frame.dlc() < min_len {
        return Err(DecodeError::TooShort {
            need: min_len,
            got: frame.dlc(),
        });
    }
    Ok(frame.data())
}

pub(crate) fn be_u16(d: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([d[off], d[off + 1]])
}

pub(crate) fn be_u32(d: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([d[off], d[off + 1], d[off + 2], d[off + 3]])
}

pub(crate) fn be_f32(d: &[u8], off: usize) -> f32 {
    f32::from_bits(be_u32(d, off))
}

// ── Decoder ───────────────────────────────────────────────────

/// One decoded frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Bms(BmsLimits),
    ChargeAh(f32),
    DischargeAh(f32),
    Control(ControlReading),
    Telemetry(TelemetryReading),
    TerminalPower(TerminalPower),
    TerminalStatus(TerminalStatus),
    /// Charger heartbeat alive flag.
    Heartbeat(bool),
}

/// Per-bus dispatch on the 29-bit arbitration ID.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    current_scale: ChargerCurrentScale,
}

impl Decoder {
    pub const fn new(current_scale: ChargerCurrentScale) -> Self {
        Self { current_scale }
    }

    pub fn current_scale(&self) -> ChargerCurrentScale {
        self.current_scale
    }

    /// Map a frame received on `bus` to a typed reading.
    ///
    /// IDs that belong to the other bus are reported as unknown: the
    /// charger heartbeat ID doubles as our own feedback frame on the BMS
    /// bus and must not be decoded there.
    pub fn decode(&self, bus: BusId, frame: &CanFrame) -> Result<Decoded, DecodeError> {
        let id = frame.id() & EXT_ID_MASK;
        match bus {
            BusId::Charger => match id {
                ids::CTRL_RESPONSE => charger::parse_control(frame).map(Decoded::Control),
                ids::TELEM_RESPONSE => {
                    charger::parse_telemetry(frame, self.current_scale).map(Decoded::Telemetry)
                }
                ids::TERMINAL_POWER => {
                    charger::parse_terminal_power(frame).map(Decoded::TerminalPower)
                }
                ids::TERMINAL_STATUS => {
                    charger::parse_terminal_status(frame).map(Decoded::TerminalStatus)
                }
                ids::HEARTBEAT => charger::parse_heartbeat(frame).map(Decoded::Heartbeat),
                other => Err(DecodeError::UnknownId(other)),
            },
            BusId::Bms => match id {
                ids::BMS_LIMITS => bms::parse_limits(frame).map(Decoded::Bms),
                ids::CHARGE_AH_RESPONSE => bms::parse_ah_total(frame).map(Decoded::ChargeAh),
                ids::DISCHARGE_AH_RESPONSE => {
                    bms::parse_ah_total(frame).map(Decoded::DischargeAh)
                }
                other => Err(DecodeError::UnknownId(other)),
            },
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(ChargerCurrentScale::Deci)
    }
}
