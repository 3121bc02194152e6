//! Delivered energy accounting.
//!
//! Integrates terminal `V × I` over time while the gate is open.  The
//! accumulator is cumulative for the life of the process and is never
//! reset by a glitch: an implausible step is dropped on its own.

use crate::config::SystemConfig;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Why a step contributed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Glitch {
    /// Loop stalled longer than `energy_max_step_ms`.
    StepTooLong,
    /// Increment would be negative.
    Negative,
    /// Implied power above `energy_max_power_w`.
    ImplausiblePower,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// Gate closed; integration paused.
    Paused,
    /// Voltage or current outside the plausible range.
    OutOfRange,
    /// First sample after the gate opened; nothing to integrate yet.
    Seeded,
    /// Watt-hours added.
    Added(f64),
    Discarded(Glitch),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyMeter {
    wh: f64,
    last_ms: Option<u64>,
    discarded: u32,
}

impl EnergyMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wh(&self) -> f64 {
        self.wh
    }

    /// Steps dropped as glitches.
    pub fn discarded(&self) -> u32 {
        self.discarded
    }

    pub fn step(
        &mut self,
        gate_open: bool,
        volts: f32,
        amps: f32,
        now_ms: u64,
        cfg: &SystemConfig,
    ) -> Step {
        if !gate_open {
            self.last_ms = None;
            return Step::Paused;
        }
        let plausible = cfg.terminal_voltage_band.contains(volts)
            && amps > 0.0
            && amps <= cfg.max_current_a;
        let Some(last) = self.last_ms.replace(now_ms) else {
            return if plausible { Step::Seeded } else { Step::OutOfRange };
        };
        if !plausible {
            return Step::OutOfRange;
        }

        let dt_ms = now_ms.saturating_sub(last);
        if dt_ms > u64::from(cfg.energy_max_step_ms) {
            return self.discard(Glitch::StepTooLong);
        }
        let watts = f64::from(volts) * f64::from(amps);
        if watts > f64::from(cfg.energy_max_power_w) {
            return self.discard(Glitch::ImplausiblePower);
        }
        let added = watts * dt_ms as f64 / MS_PER_HOUR;
        if added < 0.0 {
            return self.discard(Glitch::Negative);
        }
        self.wh += added;
        Step::Added(added)
    }

    fn discard(&mut self, glitch: Glitch) -> Step {
        self.discarded = self.discarded.saturating_add(1);
        log::debug!("energy step discarded: {glitch:?}");
        Step::Discarded(glitch)
    }
}
