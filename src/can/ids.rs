//! Arbitration IDs and function codes of the two peer dialects.
//!
//! Every value here is fixed by the installed hardware and must not be
//! changed without a matching charger / BMS firmware change.

// ---------------------------------------------------------------------------
// Charger bus
// ---------------------------------------------------------------------------

/// Control group request (enable + setpoints).
pub const CTRL_REQUEST: u32 = 0x0681_81FE;
/// Control group response.
pub const CTRL_RESPONSE: u32 = 0x0681_817E;
/// Telemetry group request.
pub const TELEM_REQUEST: u32 = 0x0681_82FE;
/// Telemetry group response.
pub const TELEM_RESPONSE: u32 = 0x0681_827E;
/// Terminal voltage/current, periodic from the charger.
pub const TERMINAL_POWER: u32 = 0x0043_3F01;
/// Terminal charging status, periodic from the charger.
pub const TERMINAL_STATUS: u32 = 0x0047_3F01;
/// Charger heartbeat.  The same ID carries our feedback frame on the BMS bus.
pub const HEARTBEAT: u32 = 0x18FF_50E5;

// ---------------------------------------------------------------------------
// BMS bus
// ---------------------------------------------------------------------------

/// BMS charge request: voltage/current limits and permit flags.
pub const BMS_LIMITS: u32 = 0x1806_E5F4;
/// Cumulative charge Ah request / response.
pub const CHARGE_AH_REQUEST: u32 = 0x160B_0180;
pub const CHARGE_AH_RESPONSE: u32 = 0x160B_8001;
/// Cumulative discharge Ah request / response.
pub const DISCHARGE_AH_REQUEST: u32 = 0x160D_0180;
pub const DISCHARGE_AH_RESPONSE: u32 = 0x160D_8001;

/// Charger feedback frame to the BMS.
pub const CHARGER_FEEDBACK: u32 = HEARTBEAT;

// ---------------------------------------------------------------------------
// Group function codes (payload byte 1)
// ---------------------------------------------------------------------------

pub mod func {
    /// Output enable command / status.
    pub const ENABLE: u8 = 0x32;
    /// Voltage limit setpoint (raw / 1024 V).
    pub const VOLTAGE_LIMIT: u8 = 0x00;
    /// Current limit setpoint (raw / 30.5 A).
    pub const CURRENT_LIMIT: u8 = 0x03;

    /// Output voltage (raw / 1024 V).
    pub const OUTPUT_VOLTAGE: u8 = 0x84;
    /// Output current.
    pub const OUTPUT_CURRENT: u8 = 0x82;
    /// Vendor metric, raw u16.
    pub const METRIC_79: u8 = 0x79;
    /// Module temperature (raw × 0.001 °C).
    pub const TEMPERATURE: u8 = 0x80;
    /// Vendor metric, big-endian f32.
    pub const METRIC_83: u8 = 0x83;

    pub const CONTROL_GROUP: &[u8] = &[ENABLE, VOLTAGE_LIMIT, CURRENT_LIMIT];
    pub const TELEMETRY_GROUP: &[u8] = &[
        OUTPUT_VOLTAGE,
        OUTPUT_CURRENT,
        METRIC_79,
        TEMPERATURE,
        METRIC_83,
    ];
}
