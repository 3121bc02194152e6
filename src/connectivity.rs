//! Battery / gun connectivity estimation.
//!
//! Asymmetric on purpose: any single in-band voltage asserts "connected"
//! on the frame that carried it, while "disconnected" needs one of three
//! time-windowed rules to fire on the evaluation cadence.
//!
//! ```text
//!  decode ──▶ connect_evidence() ──▶ both flags true, BMS activity refreshed
//!
//!  every 500 ms ──▶ DisconnectDetector::evaluate()
//!                     A: BMS silent > 3 s
//!                     B: charging, V in band, I < 0.5 A for > 5 s
//!                     C: V falling faster than 2 V/s over >= 0.5 s
//! ```

use core::fmt;

use crate::config::SystemConfig;
use crate::protocol::charger::{ControlReading, TelemetryReading};
use crate::protocol::Decoded;

/// Derived connectivity flags plus the activity stamp rule A watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub battery_connected: bool,
    pub gun_connected: bool,
    pub last_bms_activity_ms: Option<u64>,
}

impl ConnectivityState {
    pub fn is_connected(&self) -> bool {
        self.battery_connected && self.gun_connected
    }

    /// Assert both flags and refresh the activity stamp.
    pub fn mark_connected(&mut self, now_ms: u64) {
        self.battery_connected = true;
        self.gun_connected = true;
        self.note_bms_activity(now_ms);
    }

    /// Refresh the activity stamp only.  Every BMS limits frame counts,
    /// in band or not.
    pub fn note_bms_activity(&mut self, now_ms: u64) {
        self.last_bms_activity_ms = Some(match self.last_bms_activity_ms {
            Some(prev) => prev.max(now_ms),
            None => now_ms,
        });
    }

    pub fn mark_disconnected(&mut self) {
        self.battery_connected = false;
        self.gun_connected = false;
    }
}

/// Which in-band reading asserted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evidence {
    BmsVoltage,
    ChargerVoltage,
    ChargerVoltageLimit,
    TerminalVoltage,
}

/// Connection evidence carried by a single decoded frame.
///
/// Only the frame just decoded is inspected, so a stale reading can never
/// keep re-asserting the connection.
pub fn connect_evidence(decoded: &Decoded, cfg: &SystemConfig) -> Option<Evidence> {
    match *decoded {
        Decoded::Bms(limits) if cfg.bms_voltage_band.contains(limits.max_voltage) => {
            Some(Evidence::BmsVoltage)
        }
        Decoded::Telemetry(TelemetryReading::OutputVoltage(v))
            if cfg.charger_voltage_band.contains(v) =>
        {
            Some(Evidence::ChargerVoltage)
        }
        Decoded::Control(ControlReading::VoltageLimit(v)) if cfg.bms_voltage_band.contains(v) => {
            Some(Evidence::ChargerVoltageLimit)
        }
        Decoded::TerminalPower(p) if cfg.terminal_voltage_band.contains(p.volts) => {
            Some(Evidence::TerminalVoltage)
        }
        _ => None,
    }
}

// ── Disconnect detection ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Rule A.
    BmsSilent,
    /// Rule B.
    ZeroCurrent,
    /// Rule C.
    VoltageCollapse,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BmsSilent => write!(f, "BMS silent"),
            Self::ZeroCurrent => write!(f, "zero current while charging"),
            Self::VoltageCollapse => write!(f, "terminal voltage collapse"),
        }
    }
}

/// Everything one evaluation needs, read under a single lock.
#[derive(Debug, Clone, Copy)]
pub struct DetectorInputs {
    pub connectivity: ConnectivityState,
    pub tx_active: bool,
    pub hw_enabled: bool,
    pub terminal_volts: f32,
    pub terminal_amps: f32,
}

/// History kept between evaluations.  Owned by the comm thread.
#[derive(Debug, Clone, Default)]
pub struct DisconnectDetector {
    zero_since_ms: Option<u64>,
    prev_sample: Option<(f32, u64)>,
    last_eval_ms: Option<u64>,
}

impl DisconnectDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluation cadence check.
    pub fn due(&self, now_ms: u64, cfg: &SystemConfig) -> bool {
        self.last_eval_ms
            .is_none_or(|t| now_ms.saturating_sub(t) >= u64::from(cfg.disconnect_eval_interval_ms))
    }

    /// Run rules A, B and C.  Trackers update even while disconnected so
    /// that a reconnect starts from current samples.
    pub fn evaluate(
        &mut self,
        inputs: &DetectorInputs,
        cfg: &SystemConfig,
        now_ms: u64,
    ) -> Option<DisconnectCause> {
        self.last_eval_ms = Some(now_ms);
        let connected = inputs.connectivity.battery_connected || inputs.connectivity.gun_connected;

        let silent = connected && self.bms_silent(inputs, cfg, now_ms);
        let zero = self.zero_current(inputs, cfg, now_ms);
        let collapse = self.voltage_collapse(inputs, cfg, now_ms);

        if !connected {
            return None;
        }
        if silent {
            Some(DisconnectCause::BmsSilent)
        } else if zero {
            self.zero_since_ms = None;
            Some(DisconnectCause::ZeroCurrent)
        } else if collapse {
            Some(DisconnectCause::VoltageCollapse)
        } else {
            None
        }
    }

    fn bms_silent(&self, inputs: &DetectorInputs, cfg: &SystemConfig, now_ms: u64) -> bool {
        inputs
            .connectivity
            .last_bms_activity_ms
            .is_some_and(|t| now_ms.saturating_sub(t) > u64::from(cfg.bms_silence_timeout_ms))
    }

    fn zero_current(&mut self, inputs: &DetectorInputs, cfg: &SystemConfig, now_ms: u64) -> bool {
        let armed = inputs.tx_active
            && inputs.hw_enabled
            && cfg.terminal_voltage_band.contains(inputs.terminal_volts);
        if !armed || !(inputs.terminal_amps < cfg.zero_current_threshold_a) {
            self.zero_since_ms = None;
            return false;
        }
        let since = *self.zero_since_ms.get_or_insert(now_ms);
        now_ms.saturating_sub(since) > u64::from(cfg.zero_current_timeout_ms)
    }

    /// The floor applies to the earlier sample, so a drop all the way to
    /// 0 V still counts as a collapse.
    fn voltage_collapse(&mut self, inputs: &DetectorInputs, cfg: &SystemConfig, now_ms: u64) -> bool {
        let v = inputs.terminal_volts;
        if !v.is_finite() {
            return false;
        }
        let Some((prev_v, prev_ms)) = self.prev_sample else {
            self.prev_sample = Some((v, now_ms));
            return false;
        };
        let dt_ms = now_ms.saturating_sub(prev_ms);
        if dt_ms < u64::from(cfg.collapse_min_interval_ms) {
            return false;
        }
        self.prev_sample = Some((v, now_ms));
        let rate = (prev_v - v) / (dt_ms as f32 / 1000.0);
        prev_v > cfg.collapse_floor_v && rate > cfg.collapse_rate_v_per_s
    }
}
