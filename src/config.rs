//! System configuration parameters
//!
//! All tunable parameters for the charge controller.  Defaults match the
//! current charger module / BMS hardware revision; values can be
//! overridden through the persisted config blob (see
//! [`ConfigPort`](crate::app::ports::ConfigPort)).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::soc::CapacityTiers;

/// Open voltage interval `(min, max)`; both ends excluded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f32,
    pub max: f32,
}

impl Band {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Strictly between the bounds.  NaN is never contained.
    pub fn contains(&self, value: f32) -> bool {
        value > self.min && value < self.max
    }
}

/// Divisor applied to the charger's 0x82 current field.
///
/// Two charger firmware generations disagree on this field; the value is
/// a property of the installed module, not a tuning knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerCurrentScale {
    /// Raw u16 in tenths of an ampere (TWAI-attached modules).
    Deci,
    /// Raw u16 as 1/1024 A fixed point (early modules).
    Fixed1024,
}

impl ChargerCurrentScale {
    pub const fn divisor(self) -> f32 {
        match self {
            Self::Deci => 10.0,
            Self::Fixed1024 => 1024.0,
        }
    }
}

/// Core system configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    // --- Plausibility ---
    /// Pack voltage band for the BMS max-voltage field
    pub bms_voltage_band: Band,
    /// Band for the charger's self-reported output voltage
    pub charger_voltage_band: Band,
    /// Band for the point-of-delivery voltage
    pub terminal_voltage_band: Band,
    /// Highest current treated as a real measurement (A)
    pub max_current_a: f32,
    /// Charger temperature above which the feedback frame flags over-temperature
    pub max_temperature_c: f32,

    // --- Disconnect detection ---
    /// Cadence of the disconnect detector (ms)
    pub disconnect_eval_interval_ms: u32,
    /// Rule A: BMS silence before declaring disconnected (ms)
    pub bms_silence_timeout_ms: u32,
    /// Rule B: current below this counts as zero (A)
    pub zero_current_threshold_a: f32,
    /// Rule B: continuous zero-current time before disconnect (ms)
    pub zero_current_timeout_ms: u32,
    /// Rule C: previous sample must be above this voltage (V)
    pub collapse_floor_v: f32,
    /// Rule C: decay rate that counts as a collapse (V/s)
    pub collapse_rate_v_per_s: f32,
    /// Rule C: minimum interval between compared samples (ms)
    pub collapse_min_interval_ms: u32,

    // --- Charger module health ---
    /// Freshness window for each periodic charger frame (ms)
    pub health_timeout_ms: u32,
    /// Number of fresh frame types required (out of 3)
    pub health_quorum: u8,

    // --- Polling ---
    /// Control group (enable + setpoints) period (ms)
    pub control_group_period_ms: u32,
    /// Telemetry group period (ms)
    pub telemetry_group_period_ms: u32,
    /// Charge / discharge Ah request interval (ms)
    pub ah_request_interval_ms: u32,
    /// Charger feedback heartbeat to the BMS (ms)
    pub feedback_interval_ms: u32,
    /// BMS silence that sets the feedback timeout flag (ms)
    pub bms_feedback_timeout_ms: u32,
    /// Comm thread loop delay (ms)
    pub comm_loop_interval_ms: u32,

    // --- Shared state ---
    /// Bounded wait on the shared state lock (ms)
    pub lock_timeout_ms: u32,

    // --- Bus supervision ---
    /// Minimum time between reinitialisation attempts per bus (ms)
    pub bus_recovery_cooldown_ms: u32,
    /// Bus status log interval (ms)
    pub bus_status_interval_ms: u32,

    // --- Energy ---
    /// Increments implying more than this power are discarded (W)
    pub energy_max_power_w: f32,
    /// Steps longer than this are discarded as a stalled loop (ms)
    pub energy_max_step_ms: u32,

    // --- SOC ---
    pub capacity: CapacityTiers,

    // --- Gate ---
    /// Gate requires the BMS charging permit
    pub gate_requires_bms_permit: bool,
    /// Gate requires battery + gun connectivity
    pub gate_requires_connectivity: bool,

    // --- Charger dialect ---
    pub charger_current_scale: ChargerCurrentScale,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            // Plausibility
            bms_voltage_band: Band::new(56.0, 85.5),
            charger_voltage_band: Band::new(56.0, 84.5),
            terminal_voltage_band: Band::new(56.0, 85.5),
            max_current_a: 300.0,
            max_temperature_c: 70.0,

            // Disconnect detection
            disconnect_eval_interval_ms: 500,
            bms_silence_timeout_ms: 3000,
            zero_current_threshold_a: 0.5,
            zero_current_timeout_ms: 5000,
            collapse_floor_v: 10.0,
            collapse_rate_v_per_s: 2.0,
            collapse_min_interval_ms: 500,

            // Health
            health_timeout_ms: 3000,
            health_quorum: 2,

            // Polling
            control_group_period_ms: 300,
            telemetry_group_period_ms: 200,
            ah_request_interval_ms: 2000,
            feedback_interval_ms: 100,  // 10 Hz
            bms_feedback_timeout_ms: 5000,
            comm_loop_interval_ms: 50,  // 20 Hz

            // Shared state
            lock_timeout_ms: 50,

            // Bus supervision
            bus_recovery_cooldown_ms: 5000,
            bus_status_interval_ms: 10_000,

            // Energy
            energy_max_power_w: 30_000.0,
            energy_max_step_ms: 5000,

            // SOC
            capacity: CapacityTiers::default(),

            // Gate
            gate_requires_bms_permit: true,
            gate_requires_connectivity: true,

            // Charger dialect
            charger_current_scale: ChargerCurrentScale::Deci,
        }
    }
}

impl SystemConfig {
    /// Range-check every field.  Invalid values are rejected, never clamped.
    pub fn validate(&self) -> Result<()> {
        for band in [
            &self.bms_voltage_band,
            &self.charger_voltage_band,
            &self.terminal_voltage_band,
        ] {
            if !(band.min >= 0.0 && band.min < band.max) {
                return Err(Error::Config("voltage band must satisfy 0 <= min < max"));
            }
        }
        if !(self.max_current_a > 0.0) {
            return Err(Error::Config("max_current_a must be positive"));
        }
        if !(self.zero_current_threshold_a >= 0.0) {
            return Err(Error::Config("zero_current_threshold_a must be >= 0"));
        }
        if !(self.collapse_rate_v_per_s > 0.0) {
            return Err(Error::Config("collapse_rate_v_per_s must be positive"));
        }
        if !(1..=3).contains(&self.health_quorum) {
            return Err(Error::Config("health_quorum must be 1-3"));
        }
        let periods = [
            self.disconnect_eval_interval_ms,
            self.bms_silence_timeout_ms,
            self.zero_current_timeout_ms,
            self.health_timeout_ms,
            self.control_group_period_ms,
            self.telemetry_group_period_ms,
            self.ah_request_interval_ms,
            self.feedback_interval_ms,
            self.comm_loop_interval_ms,
            self.lock_timeout_ms,
            self.energy_max_step_ms,
        ];
        if periods.contains(&0) {
            return Err(Error::Config("periods and timeouts must be non-zero"));
        }
        if self.lock_timeout_ms >= self.comm_loop_interval_ms * 4 {
            return Err(Error::Config("lock_timeout_ms must stay well below the comm loop"));
        }
        if !(self.energy_max_power_w > 0.0) {
            return Err(Error::Config("energy_max_power_w must be positive"));
        }
        self.capacity.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let c = SystemConfig::default();
        assert!(c.validate().is_ok());
        assert!(c.bms_voltage_band.contains(70.0));
        assert!(c.health_quorum == 2);
        assert!(c.comm_loop_interval_ms < c.disconnect_eval_interval_ms);
    }

    #[test]
    fn band_is_open_interval() {
        let b = Band::new(56.0, 85.5);
        assert!(!b.contains(56.0));
        assert!(!b.contains(85.5));
        assert!(b.contains(56.01));
        assert!(!b.contains(f32::NAN));
    }

    #[test]
    fn current_scale_divisors() {
        assert_eq!(ChargerCurrentScale::Deci.divisor(), 10.0);
        assert_eq!(ChargerCurrentScale::Fixed1024.divisor(), 1024.0);
    }

    #[test]
    fn rejects_inverted_band() {
        let c = SystemConfig {
            terminal_voltage_band: Band::new(90.0, 56.0),
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_quorum_above_three() {
        let c = SystemConfig {
            health_quorum: 4,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_zero_period() {
        let c = SystemConfig {
            control_group_period_ms: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let c = SystemConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let c2: SystemConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c, c2);
    }

    #[test]
    fn postcard_roundtrip() {
        let c = SystemConfig {
            charger_current_scale: ChargerCurrentScale::Fixed1024,
            ..Default::default()
        };
        let bytes = postcard::to_allocvec(&c).unwrap();
        let c2: SystemConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(c, c2);
    }
}
