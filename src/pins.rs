//! GPIO / peripheral pin assignments for the charge controller board.
//!
//! Single source of truth: drivers take pin numbers from here rather than
//! hard-coding them.

// ---------------------------------------------------------------------------
// Charger bus (on-chip TWAI + SN65HVD230 transceiver)
// ---------------------------------------------------------------------------

pub const TWAI_TX_GPIO: i32 = 21;
pub const TWAI_RX_GPIO: i32 = 22;

// ---------------------------------------------------------------------------
// BMS bus (MCP2515 on SPI2, 8 MHz crystal)
// ---------------------------------------------------------------------------

pub const MCP_SCK_GPIO: i32 = 18;
pub const MCP_MISO_GPIO: i32 = 19;
pub const MCP_MOSI_GPIO: i32 = 23;
pub const MCP_CS_GPIO: i32 = 5;
/// Active-low interrupt: a receive buffer holds a frame.
pub const MCP_INT_GPIO: i32 = 4;

/// SPI clock for the MCP2515 (device maximum is 10 MHz).
pub const MCP_SPI_HZ: u32 = 8_000_000;
