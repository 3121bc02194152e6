//! Safety supervisor.
//!
//! The supervisor runs **every comm tick before the gate is evaluated**
//! and accumulates a fault bitmask that is mirrored into the gate's
//! interlock field.  Gate-blocking faults keep the output disabled for as
//! long as they are active; advisory faults only feed the BMS feedback
//! frame and the logs.
//!
//! ## Fault lifecycle
//!
//! 1. A condition triggers a fault (e.g. charger bus in bus-off).
//! 2. The supervisor sets the corresponding bit and logs the edge.
//! 3. The comm loop closes the gate and notifies the backend if needed.
//! 4. Each tick the supervisor re-evaluates; a cleared condition clears
//!    the bit.  The gate does **not** re-open by itself: that still needs
//!    a fresh authorization.
//!
//! Several faults can be active at once.

use crate::can::BusId;
use crate::config::SystemConfig;
use crate::error::SafetyFault;
use crate::health::HealthState;
use crate::protocol::bms::flags;
use crate::telemetry::Telemetry;
use log::{error, info};

/// Per-tick inputs, gathered from the store and the bus supervisor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyInputs {
    /// A BMS limits frame has been seen and byte 4 forbids charging.
    pub bms_unsafe: bool,
    pub charger_health: HealthState,
    pub charger_bus_down: bool,
    pub bms_bus_down: bool,
    /// Latest charger module temperature, if ever reported.
    pub charger_temperature_c: Option<f32>,
    /// No BMS limits frame within the feedback timeout.
    pub bms_silent: bool,
}

impl SafetyInputs {
    pub fn gather(t: &Telemetry, health: HealthState, cfg: &SystemConfig, now_ms: u64) -> Self {
        Self {
            bms_unsafe: t.bms_safe_to_charge.updated_ms().is_some() && !t.bms_safe_to_charge.get(),
            charger_health: health,
            charger_bus_down: false,
            bms_bus_down: false,
            charger_temperature_c: t
                .charger_temperature
                .updated_ms()
                .map(|_| t.charger_temperature.get()),
            bms_silent: !t.bms_max_voltage.is_fresh(now_ms, cfg.bms_feedback_timeout_ms),
        }
    }

    pub fn with_bus_down(mut self, bus: BusId, down: bool) -> Self {
        match bus {
            BusId::Charger => self.charger_bus_down = down,
            BusId::Bms => self.bms_bus_down = down,
        }
        self
    }
}

/// Safety supervisor.
pub struct SafetySupervisor {
    max_temp_c: f32,
    /// Latched fault bitmask.
    faults: u8,
}

impl SafetySupervisor {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            max_temp_c: config.max_temperature_c,
            faults: 0,
        }
    }

    /// Pick up new thresholds without dropping latched faults.
    pub fn reconfigure(&mut self, config: &SystemConfig) {
        self.max_temp_c = config.max_temperature_c;
    }

    /// Evaluate all safety conditions.  Returns the updated fault bitmask.
    pub fn evaluate(&mut self, inputs: &SafetyInputs) -> u8 {
        // ── BMS permit ────────────────────────────────────────────
        self.eval_fault(SafetyFault::BmsUnsafe, inputs.bms_unsafe);

        // ── Charger module quorum ─────────────────────────────────
        self.eval_fault(
            SafetyFault::ChargerOffline,
            inputs.charger_health == HealthState::Offline,
        );

        // ── Buses ─────────────────────────────────────────────────
        self.eval_fault(SafetyFault::ChargerBusOff, inputs.charger_bus_down);
        self.eval_fault(SafetyFault::BmsBusOff, inputs.bms_bus_down);

        // ── Temperature ───────────────────────────────────────────
        self.eval_fault(
            SafetyFault::OverTemperature,
            inputs
                .charger_temperature_c
                .is_some_and(|t| t > self.max_temp_c),
        );

        // ── BMS silence ───────────────────────────────────────────
        self.eval_fault(SafetyFault::BmsSilent, inputs.bms_silent);

        self.faults
    }

    /// Current fault bitmask.
    pub fn faults(&self) -> u8 {
        self.faults
    }

    /// True if **any** fault is active.
    pub fn has_faults(&self) -> bool {
        self.faults != 0
    }

    /// Check if a specific fault is active.
    pub fn has_fault(&self, fault: SafetyFault) -> bool {
        self.faults & fault.mask() != 0
    }

    /// Active faults that keep the gate closed.
    pub fn blocking(&self) -> u8 {
        self.faults & SafetyFault::GATE_BLOCKING
    }

    /// Byte 4 of the feedback frame to the BMS.
    pub fn feedback_flags(&self, battery_connected: bool) -> u8 {
        let mut f = 0;
        if self.has_fault(SafetyFault::OverTemperature) {
            f |= flags::OVER_TEMPERATURE;
        }
        if !battery_connected {
            f |= flags::BATTERY_NOT_CONNECTED;
        }
        if self.has_fault(SafetyFault::BmsSilent) {
            f |= flags::COMM_TIMEOUT;
        }
        f
    }

    // ── Internal ──────────────────────────────────────────────────

    /// Set or clear a fault bit based on a boolean condition.
    fn eval_fault(&mut self, fault: SafetyFault, condition: bool) {
        if condition {
            if self.faults & fault.mask() == 0 {
                error!("SAFETY FAULT SET: {fault}");
            }
            self.faults |= fault.mask();
        } else {
            if self.faults & fault.mask() != 0 {
                info!("SAFETY FAULT CLEARED: {fault}");
            }
            self.faults &= !fault.mask();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sup() -> SafetySupervisor {
        SafetySupervisor::new(&SystemConfig::default())
    }

    #[test]
    fn clean_inputs_no_faults() {
        let mut s = sup();
        let inputs = SafetyInputs {
            charger_health: HealthState::Healthy,
            charger_temperature_c: Some(40.0),
            ..Default::default()
        };
        assert_eq!(s.evaluate(&inputs), 0);
        assert!(!s.has_faults());
    }

    #[test]
    fn faults_set_and_clear_independently() {
        let mut s = sup();
        let mut inputs = SafetyInputs {
            charger_bus_down: true,
            charger_temperature_c: Some(80.0),
            ..Default::default()
        };
        s.evaluate(&inputs);
        assert!(s.has_fault(SafetyFault::ChargerBusOff));
        assert!(s.has_fault(SafetyFault::OverTemperature));
        assert_eq!(s.blocking(), SafetyFault::ChargerBusOff.mask());

        inputs.charger_bus_down = false;
        s.evaluate(&inputs);
        assert!(!s.has_fault(SafetyFault::ChargerBusOff));
        assert!(s.has_fault(SafetyFault::OverTemperature));
    }

    #[test]
    fn unknown_health_is_not_offline() {
        let mut s = sup();
        s.evaluate(&SafetyInputs::default());
        assert!(!s.has_fault(SafetyFault::ChargerOffline));
        s.evaluate(&SafetyInputs {
            charger_health: HealthState::Offline,
            ..Default::default()
        });
        assert!(s.has_fault(SafetyFault::ChargerOffline));
    }

    #[test]
    fn feedback_flag_byte() {
        let mut s = sup();
        s.evaluate(&SafetyInputs {
            charger_temperature_c: Some(71.0),
            bms_silent: true,
            ..Default::default()
        });
        assert_eq!(s.feedback_flags(true), 0x02 | 0x10);
        assert_eq!(s.feedback_flags(false), 0x02 | 0x08 | 0x10);
    }

    #[test]
    fn gather_requires_a_seen_bms_frame() {
        let cfg = SystemConfig::default();
        let mut t = Telemetry::new();
        let i = SafetyInputs::gather(&t, HealthState::Unknown, &cfg, 0);
        assert!(!i.bms_unsafe);
        assert!(i.bms_silent);

        t.bms_safe_to_charge.set(false, 10);
        t.bms_max_voltage.set(72.0, 10);
        let i = SafetyInputs::gather(&t, HealthState::Unknown, &cfg, 100);
        assert!(i.bms_unsafe);
        assert!(!i.bms_silent);
        assert!(i.with_bus_down(BusId::Bms, true).bms_bus_down);
    }
}
