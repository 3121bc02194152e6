//! Backend bridge — runs on the protocol task.
//!
//! Connects the OCPP client ([`BackendClient`]) to the charging core:
//!
//! - delivers queued [`BackendRequest`]s from the comm thread,
//! - answers the library's sampling callbacks from a [`MeterSnapshot`]
//!   taken once per pump, so the library never waits on the store lock,
//! - turns backend notifications into gate changes.
//!
//! The bridge never writes to a CAN bus.  Gate changes reach the charger
//! through the comm thread's next control slot.

use std::sync::Arc;

use log::{info, warn};

use crate::app::ports::{
    BackendClient, BackendNotification, BackendRequest, EvseReadings, Measurand,
};
use crate::app::service::CommShared;
use crate::config::SystemConfig;
use crate::protocol::charger::TerminalPower;
use crate::store::StoreState;

// ───────────────────────────────────────────────────────────────
// Meter snapshot
// ───────────────────────────────────────────────────────────────

/// Values the OCPP library samples, frozen at the start of a pump.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterSnapshot {
    pub plugged: bool,
    pub evse_ready: bool,
    pub ev_ready: bool,
    pub energy_wh: f64,
    pub power_w: f32,
    pub soc_percent: Option<f32>,
    pub current_offered_a: Option<f32>,
    pub temperature_c: Option<f32>,
    pub voltage_v: Option<f32>,
    pub current_import_a: Option<f32>,
}

impl MeterSnapshot {
    pub fn capture(s: &StoreState, config: &SystemConfig, now_ms: u64) -> Self {
        let t = &s.telemetry;
        let c = &s.connectivity;
        let terminal = t
            .terminal
            .is_fresh(now_ms, config.health_timeout_ms)
            .then(|| t.terminal.get());
        let seen = |updated: Option<u64>, value: f32| updated.map(|_| value);

        Self {
            plugged: c.gun_connected,
            evse_ready: c.battery_connected && c.gun_connected && s.charger_health.is_healthy(),
            ev_ready: c.battery_connected,
            energy_wh: s.energy.wh().max(0.0),
            power_w: terminal.map_or(0.0, |p| plausible_power(p, config)),
            soc_percent: t.soc.get().map(|e| e.percent),
            current_offered_a: seen(t.bms_max_current.updated_ms(), t.bms_max_current.get()),
            temperature_c: seen(
                t.charger_temperature.updated_ms(),
                t.charger_temperature.get(),
            ),
            voltage_v: terminal.map(|p| p.volts),
            current_import_a: terminal.map(|p| p.amps),
        }
    }
}

/// Terminal `V × I`, or zero when either reading is out of range.
fn plausible_power(p: TerminalPower, config: &SystemConfig) -> f32 {
    let in_band = config.terminal_voltage_band.contains(p.volts);
    if in_band && (0.0..=config.max_current_a).contains(&p.amps) {
        p.watts()
    } else {
        0.0
    }
}

impl EvseReadings for MeterSnapshot {
    fn plugged(&self) -> bool {
        self.plugged
    }

    fn evse_ready(&self) -> bool {
        self.evse_ready
    }

    fn ev_ready(&self) -> bool {
        self.ev_ready
    }

    fn energy_wh(&self) -> u32 {
        self.energy_wh as u32
    }

    fn power_w(&self) -> f32 {
        self.power_w
    }

    fn measurand(&self, m: Measurand) -> Option<f32> {
        match m {
            Measurand::SoC => self.soc_percent,
            Measurand::CurrentOffered => self.current_offered_a,
            Measurand::Temperature => self.temperature_c,
            Measurand::Voltage => self.voltage_v,
            Measurand::CurrentImport => self.current_import_a,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Bridge
// ───────────────────────────────────────────────────────────────

/// Why a remote start was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRefusal {
    NotConnected,
    BmsNotReady,
    Interlocked,
    TransactionRunning,
    Busy,
}

pub struct BackendBridge {
    shared: Arc<CommShared>,
    config: SystemConfig,
    snapshot: MeterSnapshot,
}

impl BackendBridge {
    pub fn new(config: SystemConfig, shared: Arc<CommShared>) -> Self {
        Self {
            shared,
            config,
            snapshot: MeterSnapshot::default(),
        }
    }

    pub fn snapshot(&self) -> &MeterSnapshot {
        &self.snapshot
    }

    /// One protocol-task iteration.
    pub fn pump(
        &mut self,
        now_ms: u64,
        client: &mut impl BackendClient,
        pending: impl IntoIterator<Item = BackendRequest>,
    ) {
        for request in pending {
            info!("OCPP | -> {request:?}");
            client.deliver(request);
        }

        let config = &self.config;
        if let Ok(snap) = self
            .shared
            .store
            .with(|s| MeterSnapshot::capture(s, config, now_ms))
        {
            self.snapshot = snap;
        }
        client.poll(&self.snapshot);

        while let Some(note) = client.take_notification() {
            self.on_notification(note, client);
        }

        let authorized = client.is_charging_authorized();
        let revoked = self.shared.store.with(|s| {
            if s.gate.inputs.authorized && !authorized {
                s.gate.close();
                true
            } else {
                false
            }
        });
        if revoked == Ok(true) {
            warn!("OCPP | authorization withdrawn, gate closed");
        }
    }

    fn on_notification(&mut self, note: BackendNotification, client: &mut impl BackendClient) {
        match note {
            BackendNotification::RemoteStartRequested(id_tag) => {
                let verdict = self.check_remote_start();
                match verdict {
                    Ok(()) => info!("OCPP | remote start for {id_tag} accepted"),
                    Err(why) => warn!("OCPP | remote start for {id_tag} rejected: {why:?}"),
                }
                client.respond_remote_start(verdict.is_ok());
            }
            BackendNotification::TransactionStarted(id) => {
                match self.shared.store.with(|s| s.gate.transaction_started(id)) {
                    Ok(()) => info!("OCPP | transaction {id} started"),
                    Err(e) => warn!("OCPP | transaction {id} start not applied: {e}"),
                }
            }
            BackendNotification::RemoteStopRequested => {
                if let Ok(Some(id)) = self.shared.store.with(|s| s.gate.close()) {
                    info!("OCPP | remote stop for transaction {id}");
                }
            }
            BackendNotification::TransactionStopped => {
                match self.shared.store.with(|s| s.gate.transaction_stopped()) {
                    Ok(()) => info!("OCPP | transaction stopped"),
                    Err(e) => warn!("OCPP | transaction stop not applied: {e}"),
                }
            }
        }
    }

    /// A remote start is accepted only with battery and gun connected,
    /// the BMS permitting charge, no gate-blocking interlock and no
    /// transaction already running.
    pub fn check_remote_start(&self) -> Result<(), StartRefusal> {
        self.shared
            .store
            .with(|s| {
                let view = s.gate_view();
                if !view.connected {
                    Err(StartRefusal::NotConnected)
                } else if !s.telemetry.bms_safe_to_charge.get() {
                    Err(StartRefusal::BmsNotReady)
                } else if view.interlocks != 0 {
                    Err(StartRefusal::Interlocked)
                } else if view.inputs.tx_active {
                    Err(StartRefusal::TransactionRunning)
                } else {
                    Ok(())
                }
            })
            .unwrap_or(Err(StartRefusal::Busy))
    }
}
