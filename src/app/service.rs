//! Application service — the comm thread's core.
//!
//! [`AppService`] owns the decoder, safety supervisor, disconnect
//! detector and polling scheduler.  Shared state lives in
//! [`CommShared`], which the receiver and protocol threads also hold.
//! All I/O flows through port traits injected at call sites, so the
//! whole service runs against mock adapters in tests.
//!
//! ```text
//!  FrameRing ×2 ──▶ ┌──────────────────────────────┐ ──▶ EventSink
//!                   │          AppService          │
//!  CanBusPort  ◀──▶ │ decode · detect · health     │ ──▶ BackendPort
//!                   │ safety · energy · poll       │
//!                   └──────────────────────────────┘
//! ```

use std::sync::Arc;

use log::{error, info, warn};

use crate::can::ring::RING_CAPACITY;
use crate::can::{BusId, BusState, CanFrame, FrameRing};
use crate::config::SystemConfig;
use crate::connectivity::{DetectorInputs, DisconnectDetector};
use crate::diagnostics::{DiagnosticsCounters, ExternalCounts, RuntimeMetrics};
use crate::error::DecodeError;
use crate::gate::{CloseReason, GatePolicy, StopReason};
use crate::health;
use crate::protocol::Decoder;
use crate::protocol::charger::TerminalPower;
use crate::safety::{SafetyInputs, SafetySupervisor};
use crate::scheduler::{self, PollingScheduler};
use crate::store::{SharedStore, StoreState};

use super::commands::AppCommand;
use super::events::{AppEvent, BusStatusData, TelemetryData};
use super::ports::{Alert, BackendPort, CanBusPort, ConfigPort, EventSink};

/// idTag used for starts requested at the station.
pub const LOCAL_ID_TAG: &str = "LOCAL";

/// Delay between the last config change and the automatic save.
const AUTO_SAVE_DELAY_MS: u64 = 5000;

// ───────────────────────────────────────────────────────────────
// Shared handles
// ───────────────────────────────────────────────────────────────

/// State reachable from every thread.
pub struct CommShared {
    pub store: SharedStore,
    pub rings: [FrameRing; 2],
    pub diag: DiagnosticsCounters,
}

impl CommShared {
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            store: SharedStore::from_config(config),
            rings: [FrameRing::new(), FrameRing::new()],
            diag: DiagnosticsCounters::new(),
        }
    }

    pub fn ring(&self, bus: BusId) -> &FrameRing {
        &self.rings[bus.index()]
    }
}

/// Per-bus supervision bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
struct BusWatch {
    down: bool,
    degraded: bool,
    last_attempt_ms: Option<u64>,
}

/// What a forced close found.
#[derive(Debug, Clone, Copy)]
struct Closed {
    was_open: bool,
    tx_active: bool,
}

// ───────────────────────────────────────────────────────────────
// AppService
// ───────────────────────────────────────────────────────────────

/// The application service orchestrates all domain logic on the comm thread.
pub struct AppService {
    config: SystemConfig,
    shared: Arc<CommShared>,
    decoder: Decoder,
    safety: SafetySupervisor,
    detector: DisconnectDetector,
    scheduler: PollingScheduler,
    buses: [BusWatch; 2],
    gate_was_open: bool,
    /// Emergency stop issued but not yet written to the store.
    estop_pending: bool,
    battery_connected: bool,
    tick_count: u64,
    started_ms: u64,
    last_status_ms: Option<u64>,
    config_dirty: bool,
    dirty_since_ms: u64,
    save_requested: bool,
}

impl AppService {
    /// Construct the service from configuration and the shared handles.
    pub fn new(config: SystemConfig, shared: Arc<CommShared>) -> Self {
        Self {
            decoder: Decoder::new(config.charger_current_scale),
            safety: SafetySupervisor::new(&config),
            detector: DisconnectDetector::new(),
            scheduler: PollingScheduler::new(),
            buses: [BusWatch::default(); 2],
            gate_was_open: false,
            estop_pending: false,
            battery_connected: false,
            tick_count: 0,
            started_ms: 0,
            last_status_ms: None,
            config_dirty: false,
            dirty_since_ms: 0,
            save_requested: false,
            config,
            shared,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        self.started_ms = now_ms;
        sink.emit(&AppEvent::Started);
        info!("AppService started");
    }

    // ── Per-tick orchestration ────────────────────────────────

    /// Run one comm cycle: drain → buses → disconnect → health →
    /// safety → energy → polling → status.
    pub fn tick(
        &mut self,
        now_ms: u64,
        bus: &mut impl CanBusPort,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        self.tick_count += 1;

        // 0. Finish an emergency stop the store was too busy to take
        if self.estop_pending {
            self.retry_emergency_close(sink);
        }

        // 1. Decode everything the receivers queued
        for id in BusId::ALL {
            self.drain(id, now_ms, bus, backend, sink);
        }

        // 2. Bus-off / stopped controllers
        for id in BusId::ALL {
            self.supervise_bus(id, now_ms, bus, backend, sink);
        }

        // 3. Disconnect rules, on their own cadence
        if self.detector.due(now_ms, &self.config) {
            self.detect_disconnect(now_ms, backend, sink);
        }

        // 4. Charger module quorum
        self.update_health(now_ms, backend, sink);

        // 5. Safety interlocks
        self.evaluate_safety(now_ms, sink);

        // 6. Energy register and gate edge
        self.account_energy(now_ms, sink);

        // 7. Outbound requests
        let flags = self.safety.feedback_flags(self.battery_connected);
        let report = self.scheduler.tick(
            now_ms,
            &self.shared.store,
            &self.config,
            flags,
            bus,
            &self.shared.diag,
        );
        if let Some(enable) = report.enable_sent {
            sink.emit(&AppEvent::EnableSent(enable));
        }

        // 8. Periodic status
        if scheduler::due(self.last_status_ms, now_ms, self.config.bus_status_interval_ms) {
            self.last_status_ms = Some(now_ms);
            self.report_status(now_ms, bus, sink);
        }
    }

    // ── Command handling ──────────────────────────────────────

    /// Process an external command (console, configuration tooling).
    pub fn handle_command(
        &mut self,
        cmd: AppCommand,
        now_ms: u64,
        bus: &mut impl CanBusPort,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        match cmd {
            AppCommand::OperatorStart => {
                let checked = self.shared.store.with(|s| {
                    if !s.connectivity.battery_connected {
                        Err("battery not connected")
                    } else if !s.telemetry.bms_safe_to_charge.get() {
                        Err("BMS does not permit charging")
                    } else {
                        s.gate.operator_enable();
                        Ok(())
                    }
                });
                match checked {
                    Ok(Ok(())) => {
                        info!("Operator start accepted, requesting transaction");
                        backend.request_start(LOCAL_ID_TAG);
                    }
                    Ok(Err(why)) => {
                        warn!("Operator start rejected: {why}");
                        sink.emit(&AppEvent::StartRejected(why));
                    }
                    Err(_) => {
                        warn!("Operator start rejected: store busy");
                        sink.emit(&AppEvent::StartRejected("controller busy"));
                    }
                }
            }
            AppCommand::EmergencyStop => self.emergency_stop(bus, backend, sink),
            AppCommand::UpdateConfig(new_config) => match new_config.validate() {
                Ok(()) => {
                    self.decoder = Decoder::new(new_config.charger_current_scale);
                    self.safety.reconfigure(&new_config);
                    // The store keeps its lock timeout until restart.
                    self.config = new_config;
                    self.mark_config_dirty(now_ms);
                    info!("Configuration updated at runtime");
                }
                Err(e) => warn!("Configuration update rejected: {e}"),
            },
            AppCommand::SaveConfig => {
                self.save_requested = true;
                self.mark_config_dirty(now_ms);
                info!("Explicit config save requested");
            }
        }
    }

    /// Close the gate, write the disable command in this call and tell
    /// the backend.
    pub fn emergency_stop(
        &mut self,
        bus: &mut impl CanBusPort,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        error!("EMERGENCY STOP");
        let closed = self.force_close(CloseReason::EmergencyStop, |_| {}, backend, sink);
        if closed.is_none() {
            // The gate still reads open: keep the enable slot disabled
            // until the close lands, and ask for the stop anyway.
            self.estop_pending = true;
            self.scheduler.hold_disabled(true);
            backend.request_stop(StopReason::Local);
        }
        self.scheduler.push_enable_now(false, bus, &self.shared.diag);
    }

    /// Clear the gate inputs left set by a deferred emergency stop.  The
    /// backend stop already went out with the stop itself.
    fn retry_emergency_close(&mut self, sink: &mut impl EventSink) {
        if self.shared.store.with(|s| s.gate.close()).is_err() {
            warn!("Emergency close still deferred: store busy");
            return;
        }
        self.estop_pending = false;
        self.scheduler.hold_disabled(false);
        self.gate_was_open = false;
        warn!("Charging gate CLOSED: {}", CloseReason::EmergencyStop);
        sink.emit(&AppEvent::GateClosed(CloseReason::EmergencyStop));
    }

    // ── Queries ───────────────────────────────────────────────

    /// Build a telemetry snapshot from the shared store.
    pub fn build_telemetry(&self, s: &StoreState) -> TelemetryData {
        let t = &s.telemetry;
        let terminal = t.terminal.get();
        TelemetryData {
            gate_open: s.gate_view().is_open(GatePolicy::from_config(&self.config)),
            battery_connected: s.connectivity.battery_connected,
            gun_connected: s.connectivity.gun_connected,
            bms_max_voltage: t.bms_max_voltage.get(),
            bms_max_current: t.bms_max_current.get(),
            bms_safe: t.bms_safe_to_charge.get(),
            charger_voltage: t.charger_voltage.get(),
            charger_current: t.charger_current.get(),
            charger_temperature_c: t.charger_temperature.get(),
            terminal_voltage: terminal.volts,
            terminal_current: terminal.amps,
            soc_percent: t.soc.get().map(|e| e.percent),
            energy_wh: s.energy.wh(),
            charger_health: s.charger_health,
            fault_flags: self.safety.faults(),
        }
    }

    /// Total comm ticks executed since startup.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Current active fault bitmask (0 = no faults).
    pub fn fault_flags(&self) -> u8 {
        self.safety.faults()
    }

    pub fn gate_open(&self) -> bool {
        self.gate_was_open
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<CommShared> {
        &self.shared
    }

    pub fn last_enable(&self) -> Option<bool> {
        self.scheduler.last_enable()
    }

    /// Snapshot for the periodic diagnostics line.
    pub fn runtime_metrics(&self, now_ms: u64) -> RuntimeMetrics {
        let energy_discarded = self
            .shared
            .store
            .with(|s| s.energy.discarded())
            .unwrap_or_default();
        RuntimeMetrics::collect(
            now_ms.saturating_sub(self.started_ms) / 1000,
            self.tick_count,
            &self.shared.diag,
            ExternalCounts {
                lock_timeouts: self.shared.store.lock_timeouts(),
                ring_overwritten: BusId::ALL.map(|b| self.shared.ring(b).overwritten()),
                energy_discarded,
            },
        )
    }

    // ── Internal: receive path ────────────────────────────────

    fn drain(
        &mut self,
        id: BusId,
        now_ms: u64,
        bus: &mut impl CanBusPort,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        let shared = Arc::clone(&self.shared);
        shared.ring(id).drain(RING_CAPACITY, |frame| {
            self.handle_frame(id, &frame, now_ms, bus, backend, sink);
        });
    }

    fn handle_frame(
        &mut self,
        id: BusId,
        frame: &CanFrame,
        now_ms: u64,
        bus: &mut impl CanBusPort,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        let diag = &self.shared.diag;
        let decoded = match self.decoder.decode(id, frame) {
            Ok(d) => d,
            Err(DecodeError::UnknownId(_)) => {
                diag.record_unknown_frame();
                return;
            }
            Err(e) => {
                log::debug!("{id}: frame 0x{:08X} rejected: {e}", frame.id());
                diag.record_decode_rejected();
                return;
            }
        };

        let Ok(update) = self.shared.store.apply_decoded(&decoded, now_ms, &self.config) else {
            diag.record_decode_dropped();
            return;
        };

        if update.newly_connected {
            if let Some(evidence) = update.evidence {
                sink.emit(&AppEvent::Connected(evidence));
            }
        }
        if let Some(soc) = update.applied.soc {
            sink.emit(&AppEvent::SocUpdated(soc));
        }
        if update.applied.permit_changed == Some(false) {
            self.bms_withdrew_permit(bus, backend, sink);
        }
    }

    /// The BMS flipped its permit off.  With a session running this is
    /// handled like an emergency stop.
    fn bms_withdrew_permit(
        &mut self,
        bus: &mut impl CanBusPort,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        let Some(closed) = self.force_close(CloseReason::BmsUnsafe, |_| {}, backend, sink) else {
            return;
        };
        if closed.tx_active {
            self.scheduler.push_enable_now(false, bus, &self.shared.diag);
            backend.send_alert(Alert::BmsUnsafe);
        }
    }

    // ── Internal: supervision ─────────────────────────────────

    fn supervise_bus(
        &mut self,
        id: BusId,
        now_ms: u64,
        bus: &mut impl CanBusPort,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        let state = bus.bus_state(id);
        let mut watch = self.buses[id.index()];

        if !state.needs_recovery() {
            let degraded = state == BusState::Degraded;
            if degraded != watch.degraded {
                if degraded {
                    warn!("BUS | {id} error-passive");
                } else {
                    info!("BUS | {id} running");
                }
                watch.degraded = degraded;
            }
            self.buses[id.index()] = watch;
            return;
        }

        if !watch.down {
            watch.down = true;
            error!("BUS | {id} {state:?}");
            sink.emit(&AppEvent::BusDown { bus: id, state });
            backend.send_alert(Alert::BusOff(id));
            self.force_close(CloseReason::BusOff(id), |_| {}, backend, sink);
        }

        if scheduler::due(watch.last_attempt_ms, now_ms, self.config.bus_recovery_cooldown_ms) {
            watch.last_attempt_ms = Some(now_ms);
            match bus.reinitialize(id) {
                Ok(()) => {
                    info!("BUS | {id} reinitialised");
                    self.shared.diag.record_bus_recovery(id);
                    watch.down = false;
                    watch.degraded = false;
                    sink.emit(&AppEvent::BusRecovered(id));
                    if id == BusId::Charger {
                        self.scheduler.invalidate_enable();
                    }
                }
                Err(e) => warn!("BUS | {id} reinit failed: {e}"),
            }
        }
        self.buses[id.index()] = watch;
    }

    fn detect_disconnect(
        &mut self,
        now_ms: u64,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        let Ok(inputs) = self.shared.store.with(|s| {
            let p = s.telemetry.terminal.get();
            DetectorInputs {
                connectivity: s.connectivity,
                tx_active: s.gate.inputs.tx_active,
                hw_enabled: s.gate.inputs.hw_enabled,
                terminal_volts: p.volts,
                terminal_amps: p.amps,
            }
        }) else {
            return;
        };

        let Some(cause) = self.detector.evaluate(&inputs, &self.config, now_ms) else {
            return;
        };
        warn!("CONN | disconnected: {cause}");
        sink.emit(&AppEvent::Disconnected(cause));

        let closed = self.force_close(
            CloseReason::EvDisconnected(cause),
            |s| s.connectivity.mark_disconnected(),
            backend,
            sink,
        );
        if closed.is_some_and(|c| c.tx_active) {
            backend.send_alert(Alert::EvDisconnected(cause));
        }
    }

    fn update_health(
        &mut self,
        now_ms: u64,
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) {
        let config = &self.config;
        let Ok(Some(change)) = self.shared.store.with(|s| {
            let next = health::assess(&s.telemetry, config, now_ms);
            health::transition(&mut s.charger_health, next)
        }) else {
            return;
        };

        info!("Charger module health: {} -> {}", change.from, change.to);
        sink.emit(&AppEvent::HealthChanged {
            from: change.from,
            to: change.to,
        });

        if change.raises_fault() {
            backend.notify_fault(true);
            let closed = self.force_close(CloseReason::ChargerOffline, |_| {}, backend, sink);
            if closed.is_some_and(|c| c.was_open || c.tx_active) {
                backend.send_alert(Alert::ChargerOffline);
            }
        } else if change.clears_fault() {
            backend.notify_fault(false);
        }
    }

    fn evaluate_safety(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        let prev = self.safety.faults();
        let config = &self.config;
        let buses = self.buses;
        let safety = &mut self.safety;
        let Ok(battery_connected) = self.shared.store.with(|s| {
            let inputs = SafetyInputs::gather(&s.telemetry, s.charger_health, config, now_ms)
                .with_bus_down(BusId::Charger, buses[BusId::Charger.index()].down)
                .with_bus_down(BusId::Bms, buses[BusId::Bms.index()].down);
            safety.evaluate(&inputs);
            s.gate.interlocks = safety.blocking();
            s.connectivity.battery_connected
        }) else {
            return;
        };
        self.battery_connected = battery_connected;

        let faults = self.safety.faults();
        if faults & !prev != 0 {
            warn!("Safety fault! flags=0b{:08b}", faults);
            sink.emit(&AppEvent::FaultDetected(faults));
        } else if faults == 0 && prev != 0 {
            sink.emit(&AppEvent::FaultCleared);
        }
    }

    fn account_energy(&mut self, now_ms: u64, sink: &mut impl EventSink) {
        let policy = GatePolicy::from_config(&self.config);
        let config = &self.config;
        let Ok((open, transaction_id)) = self.shared.store.with(|s| {
            let open = s.gate_view().is_open(policy);
            let terminal = if s.telemetry.terminal.is_fresh(now_ms, config.health_timeout_ms) {
                s.telemetry.terminal.get()
            } else {
                TerminalPower::default()
            };
            s.energy.step(open, terminal.volts, terminal.amps, now_ms, config);
            (open, s.gate.transaction_id)
        }) else {
            return;
        };

        if open != self.gate_was_open {
            self.gate_was_open = open;
            if open {
                info!("Charging gate OPEN (transaction {transaction_id:?})");
                sink.emit(&AppEvent::GateOpened { transaction_id });
            }
        }
    }

    /// Clear the gate inputs under one lock, together with `also`.
    /// Requests a backend stop if a transaction was running and the
    /// reason maps to one.  `None` if the store could not be locked.
    fn force_close(
        &mut self,
        reason: CloseReason,
        also: impl FnOnce(&mut StoreState),
        backend: &mut impl BackendPort,
        sink: &mut impl EventSink,
    ) -> Option<Closed> {
        let policy = GatePolicy::from_config(&self.config);
        let result = self.shared.store.with(|s| {
            let was_open = s.gate_view().is_open(policy);
            let tx_active = s.gate.inputs.tx_active;
            let had_id = s.gate.close().is_some();
            also(s);
            (Closed { was_open, tx_active }, had_id)
        });
        let Ok((closed, had_id)) = result else {
            warn!("Gate close ({reason}) deferred: store busy");
            return None;
        };

        if closed.was_open || closed.tx_active || had_id {
            warn!("Charging gate CLOSED: {reason}");
            sink.emit(&AppEvent::GateClosed(reason));
        }
        if closed.tx_active {
            if let Some(stop) = reason.stop_reason() {
                backend.request_stop(stop);
            }
        }
        self.gate_was_open = false;
        Some(closed)
    }

    fn report_status(&mut self, now_ms: u64, bus: &mut impl CanBusPort, sink: &mut impl EventSink) {
        for id in BusId::ALL {
            let ring = self.shared.ring(id);
            sink.emit(&AppEvent::BusStatus(BusStatusData {
                bus: id,
                state: bus.bus_state(id),
                ring_fill_percent: ring.fill_percent(),
                received: ring.received(),
                overwritten: ring.overwritten(),
                tx_failures: self.shared.diag.tx_failures(id),
            }));
        }
        if let Ok(snapshot) = self.shared.store.with(|s| self.build_telemetry(s)) {
            sink.emit(&AppEvent::Telemetry(snapshot));
        }
        match serde_json::to_string(&self.runtime_metrics(now_ms)) {
            Ok(json) => info!("DIAG | {json}"),
            Err(e) => warn!("DIAG | metrics serialisation failed: {e}"),
        }
    }

    // ── Config dirty-flag management ──────────────────────────

    /// Mark the config as modified.
    pub fn mark_config_dirty(&mut self, now_ms: u64) {
        if !self.config_dirty {
            self.config_dirty = true;
            self.dirty_since_ms = now_ms;
        }
    }

    /// Save 5 s after the last change, or right away after `SaveConfig`.
    /// Returns `true` if the config was saved.
    pub fn auto_save_if_needed(&mut self, now_ms: u64, storage: &impl ConfigPort) -> bool {
        if !self.config_dirty {
            return false;
        }
        if !self.save_requested && now_ms.saturating_sub(self.dirty_since_ms) < AUTO_SAVE_DELAY_MS {
            return false;
        }
        match storage.save(&self.config) {
            Ok(()) => {
                self.config_dirty = false;
                self.save_requested = false;
                info!("Config saved to NVS");
                true
            }
            Err(e) => {
                warn!("Config save failed: {}", e);
                self.save_requested = false;
                self.dirty_since_ms = now_ms;
                false
            }
        }
    }

    /// Whether the config has unsaved changes.
    pub fn is_config_dirty(&self) -> bool {
        self.config_dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::ConfigError;
    use core::cell::Cell;

    struct CountingStorage {
        saves: Cell<u32>,
    }

    impl ConfigPort for CountingStorage {
        fn load(&self) -> Result<SystemConfig, ConfigError> {
            Ok(SystemConfig::default())
        }

        fn save(&self, config: &SystemConfig) -> Result<(), ConfigError> {
            config.validate()?;
            self.saves.set(self.saves.get() + 1);
            Ok(())
        }
    }

    fn service() -> AppService {
        let config = SystemConfig::default();
        let shared = Arc::new(CommShared::new(&config));
        AppService::new(config, shared)
    }

    #[test]
    fn auto_save_waits_for_quiet_period() {
        let mut app = service();
        let storage = CountingStorage { saves: Cell::new(0) };
        app.mark_config_dirty(1000);
        assert!(!app.auto_save_if_needed(5999, &storage));
        assert!(app.auto_save_if_needed(6000, &storage));
        assert!(!app.is_config_dirty());
        assert_eq!(storage.saves.get(), 1);
    }

    #[test]
    fn telemetry_snapshot_reflects_store() {
        let app = service();
        let data = app
            .shared()
            .store
            .with(|s| {
                s.telemetry.bms_max_voltage.set(84.0, 10);
                s.connectivity.mark_connected(10);
                app.build_telemetry(s)
            })
            .unwrap();
        assert_eq!(data.bms_max_voltage, 84.0);
        assert!(data.battery_connected);
        assert!(!data.gate_open);
        assert_eq!(data.soc_percent, None);
    }
}
