//! CAN frame transport primitives.
//!
//! ```text
//!  receiver thread ──push──▶ FrameRing (64, overwrite oldest) ──pop──▶ comm thread
//! ```
//!
//! One ring per physical bus.  Frames are immutable once received and are
//! consumed exactly once by the decoder for that bus.

pub mod ids;
pub mod ring;

use core::fmt;

pub use ring::FrameRing;

/// 29-bit extended identifier mask.
pub const EXT_ID_MASK: u32 = 0x1FFF_FFFF;

/// The two physical buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusId {
    /// ESP32 TWAI controller, charger power module side.
    Charger,
    /// MCP2515 over SPI, vehicle BMS side.
    Bms,
}

impl BusId {
    pub const ALL: [BusId; 2] = [BusId::Charger, BusId::Bms];

    pub const fn index(self) -> usize {
        match self {
            Self::Charger => 0,
            Self::Bms => 1,
        }
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Charger => write!(f, "charger bus"),
            Self::Bms => write!(f, "BMS bus"),
        }
    }
}

/// Controller state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Running,
    /// Error-passive or recovering; still exchanging frames.
    Degraded,
    BusOff,
    Stopped,
}

impl BusState {
    /// States that require a full reinitialisation.
    pub const fn needs_recovery(self) -> bool {
        matches!(self, Self::BusOff | Self::Stopped)
    }
}

/// A raw CAN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    len: u8,
    data: [u8; 8],
    extended: bool,
    /// Monotonic receive time (ms).  Zero for frames built locally.
    pub timestamp_ms: u64,
}

impl CanFrame {
    /// Extended frame.  `data` longer than 8 bytes is truncated.
    pub fn extended(id: u32, data: &[u8]) -> Self {
        Self::build(id & EXT_ID_MASK, data, true)
    }

    /// Standard (11-bit) frame.
    pub fn standard(id: u16, data: &[u8]) -> Self {
        Self::build(u32::from(id) & 0x7FF, data, false)
    }

    fn build(id: u32, data: &[u8], extended: bool) -> Self {
        let len = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            id,
            len: len as u8,
            data: buf,
            extended,
            timestamp_ms: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Data length code (0–8).
    pub fn dlc(&self) -> u8 {
        self.len
    }

    /// Valid payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}
