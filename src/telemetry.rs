//! Decoded telemetry.
//!
//! Every signal carries its own last-update timestamp.  Timestamps only
//! move forward: a value written with an older clock reading keeps the
//! newer stamp.  All fields start at zero / unknown with no timestamp.

use log::{info, warn};

use crate::protocol::bms::BmsLimits;
use crate::protocol::charger::{
    ChargerStatus, ControlReading, TelemetryReading, TerminalPower, TerminalStatus,
};
use crate::protocol::Decoded;
use crate::soc::{self, CapacityTiers, SocEstimate};

/// A value plus the monotonic time (ms) it was last written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal<T> {
    value: T,
    updated_ms: Option<u64>,
}

impl<T: Copy> Signal<T> {
    pub const fn new(initial: T) -> Self {
        Self {
            value: initial,
            updated_ms: None,
        }
    }

    pub fn set(&mut self, value: T, now_ms: u64) {
        self.value = value;
        self.updated_ms = Some(match self.updated_ms {
            Some(prev) => prev.max(now_ms),
            None => now_ms,
        });
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn updated_ms(&self) -> Option<u64> {
        self.updated_ms
    }

    /// Milliseconds since the last write, `None` if never written.
    pub fn age_ms(&self, now_ms: u64) -> Option<u64> {
        self.updated_ms.map(|t| now_ms.saturating_sub(t))
    }

    /// Written less than `window_ms` ago.
    pub fn is_fresh(&self, now_ms: u64, window_ms: u32) -> bool {
        self.age_ms(now_ms)
            .is_some_and(|age| age < u64::from(window_ms))
    }
}

impl<T: Copy + Default> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Flag edges produced by one [`Telemetry::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Applied {
    /// New BMS charging-permit value, if it changed.
    pub permit_changed: Option<bool>,
    /// New BMS heating value, if it changed.
    pub heating_changed: Option<bool>,
    /// Fresh SOC derivation, if a charge total arrived.
    pub soc: Option<SocEstimate>,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    // BMS
    pub bms_max_voltage: Signal<f32>,
    pub bms_max_current: Signal<f32>,
    pub bms_safe_to_charge: Signal<bool>,
    pub bms_heating: Signal<bool>,
    pub charge_ah: Signal<f32>,
    pub discharge_ah: Signal<f32>,
    pub soc: Signal<Option<SocEstimate>>,

    // Charger control group
    pub charger_status: Signal<ChargerStatus>,
    pub charger_voltage_limit: Signal<f32>,
    pub charger_current_limit: Signal<f32>,

    // Charger telemetry group
    pub charger_voltage: Signal<f32>,
    pub charger_current: Signal<f32>,
    pub charger_temperature: Signal<f32>,
    pub metric_79: Signal<u16>,
    pub metric_83: Signal<f32>,

    // Charger periodic frames
    pub terminal: Signal<TerminalPower>,
    pub terminal_status: Signal<TerminalStatus>,
    pub heartbeat_alive: Signal<bool>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one decoded frame.  Only the fields carried by that frame
    /// change.
    pub fn apply(&mut self, decoded: &Decoded, now_ms: u64, tiers: &CapacityTiers) -> Applied {
        let mut out = Applied::default();
        match *decoded {
            Decoded::Bms(limits) => self.apply_limits(limits, now_ms, &mut out),
            Decoded::ChargeAh(ah) => {
                self.charge_ah.set(ah, now_ms);
                if let Some(est) = soc::derive(
                    ah,
                    self.discharge_ah.get(),
                    self.bms_max_current.get(),
                    tiers,
                ) {
                    self.soc.set(Some(est), now_ms);
                    out.soc = Some(est);
                }
            }
            Decoded::DischargeAh(ah) => self.discharge_ah.set(ah, now_ms),
            Decoded::Control(reading) => match reading {
                ControlReading::Status(s) => self.charger_status.set(s, now_ms),
                ControlReading::VoltageLimit(v) => self.charger_voltage_limit.set(v, now_ms),
                ControlReading::CurrentLimit(a) => self.charger_current_limit.set(a, now_ms),
            },
            Decoded::Telemetry(reading) => match reading {
                TelemetryReading::OutputVoltage(v) => self.charger_voltage.set(v, now_ms),
                TelemetryReading::OutputCurrent(a) => self.charger_current.set(a, now_ms),
                TelemetryReading::Metric79(raw) => self.metric_79.set(raw, now_ms),
                TelemetryReading::Temperature(t) => self.charger_temperature.set(t, now_ms),
                TelemetryReading::Metric83(x) => self.metric_83.set(x, now_ms),
            },
            Decoded::TerminalPower(p) => self.terminal.set(p, now_ms),
            Decoded::TerminalStatus(s) => self.terminal_status.set(s, now_ms),
            Decoded::Heartbeat(alive) => self.heartbeat_alive.set(alive, now_ms),
        }
        out
    }

    fn apply_limits(&mut self, limits: BmsLimits, now_ms: u64, out: &mut Applied) {
        let was_safe = self.bms_safe_to_charge.get();
        let was_heating = self.bms_heating.get();

        self.bms_max_voltage.set(limits.max_voltage, now_ms);
        self.bms_max_current.set(limits.max_current, now_ms);
        self.bms_safe_to_charge.set(limits.safe_to_charge, now_ms);
        self.bms_heating.set(limits.heating, now_ms);

        if limits.safe_to_charge != was_safe {
            if limits.safe_to_charge {
                info!("BMS | charging permitted");
            } else {
                warn!("BMS | charging NOT permitted");
            }
            out.permit_changed = Some(limits.safe_to_charge);
        }
        if limits.heating != was_heating {
            info!("BMS | heating {}", if limits.heating { "active" } else { "off" });
            out.heating_changed = Some(limits.heating);
        }
    }
}
