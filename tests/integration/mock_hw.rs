//! Mock adapters for integration tests.
//!
//! Records every bus and backend call so tests can assert on the full
//! history without a CAN controller or a central system.

use std::sync::Arc;

use evse_controller::adapters::backend::OfflineBackend;
use evse_controller::app::commands::AppCommand;
use evse_controller::app::events::AppEvent;
use evse_controller::app::ports::{Alert, BackendPort, BackendRequest, CanBusPort, EventSink, IdTag};
use evse_controller::app::service::{AppService, CommShared};
use evse_controller::backend::BackendBridge;
use evse_controller::can::ids::{self, func};
use evse_controller::can::{BusId, BusState, CanFrame};
use evse_controller::config::SystemConfig;
use evse_controller::error::BusError;
use evse_controller::gate::StopReason;

// ── Bus call record ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BusCall {
    Transmit(BusId, CanFrame),
    Reinit(BusId),
}

// ── MockBus ───────────────────────────────────────────────────

pub struct MockBus {
    pub calls: Vec<BusCall>,
    pub states: [BusState; 2],
    pub reinit_ok: bool,
}

#[allow(dead_code)]
impl MockBus {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            states: [BusState::Running; 2],
            reinit_ok: true,
        }
    }

    pub fn set_state(&mut self, bus: BusId, state: BusState) {
        self.states[bus.index()] = state;
    }

    /// Frames accepted on `bus`, oldest first.
    pub fn sent(&self, bus: BusId) -> Vec<CanFrame> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                BusCall::Transmit(b, f) if *b == bus => Some(*f),
                _ => None,
            })
            .collect()
    }

    /// Enable commands accepted on the charger bus (`true` = enable).
    pub fn enables(&self) -> Vec<bool> {
        self.sent(BusId::Charger)
            .iter()
            .filter(|f| f.id() == ids::CTRL_REQUEST && f.data()[1] == func::ENABLE)
            .map(|f| f.data()[3] == 0x00)
            .collect()
    }

    pub fn reinits(&self, bus: BusId) -> usize {
        self.calls.iter().filter(|c| **c == BusCall::Reinit(bus)).count()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CanBusPort for MockBus {
    fn transmit(&mut self, bus: BusId, frame: &CanFrame) -> Result<(), BusError> {
        if self.states[bus.index()].needs_recovery() {
            return Err(BusError::BusOff(bus));
        }
        self.calls.push(BusCall::Transmit(bus, *frame));
        Ok(())
    }

    fn bus_state(&mut self, bus: BusId) -> BusState {
        self.states[bus.index()]
    }

    fn reinitialize(&mut self, bus: BusId) -> Result<(), BusError> {
        self.calls.push(BusCall::Reinit(bus));
        if self.reinit_ok {
            self.states[bus.index()] = BusState::Running;
            Ok(())
        } else {
            Err(BusError::Driver(bus, -1))
        }
    }
}

// ── MockBackend ───────────────────────────────────────────────

/// Records outward requests.  `delivered` marks how many have been
/// handed to the protocol side so far.
#[derive(Default)]
pub struct MockBackend {
    pub requests: Vec<BackendRequest>,
    pub delivered: usize,
}

#[allow(dead_code)]
impl MockBackend {
    pub fn stops(&self) -> Vec<StopReason> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                BackendRequest::Stop(reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                BackendRequest::Alert(a) => Some(*a),
                _ => None,
            })
            .collect()
    }

    pub fn faults(&self) -> Vec<bool> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                BackendRequest::Fault(f) => Some(*f),
                _ => None,
            })
            .collect()
    }

    fn take_pending(&mut self) -> Vec<BackendRequest> {
        let pending = self.requests[self.delivered..].to_vec();
        self.delivered = self.requests.len();
        pending
    }
}

impl BackendPort for MockBackend {
    fn send_alert(&mut self, alert: Alert) {
        self.requests.push(BackendRequest::Alert(alert));
    }

    fn request_stop(&mut self, reason: StopReason) {
        self.requests.push(BackendRequest::Stop(reason));
    }

    fn request_start(&mut self, id_tag: &str) {
        let tag = IdTag::try_from(id_tag).unwrap_or_default();
        self.requests.push(BackendRequest::Start(tag));
    }

    fn notify_fault(&mut self, faulted: bool) {
        self.requests.push(BackendRequest::Fault(faulted));
    }
}

// ── CollectSink ───────────────────────────────────────────────

#[derive(Default)]
pub struct CollectSink {
    pub events: Vec<AppEvent>,
}

#[allow(dead_code)]
impl CollectSink {
    pub fn count(&self, pred: impl Fn(&AppEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    pub fn contains(&self, event: &AppEvent) -> bool {
        self.events.contains(event)
    }
}

impl EventSink for CollectSink {
    fn emit(&mut self, event: &AppEvent) {
        self.events.push(event.clone());
    }
}

// ── Frame builders ────────────────────────────────────────────

pub fn bms_limits(volts: f32, amps: f32, safe: bool) -> CanFrame {
    let v = ((volts * 10.0).round() as u16).to_be_bytes();
    let a = ((amps * 10.0).round() as u16).to_be_bytes();
    let permit = if safe { 0x00 } else { 0x01 };
    CanFrame::extended(ids::BMS_LIMITS, &[v[0], v[1], a[0], a[1], permit, 0, 0, 0])
}

pub fn charge_ah(ah: f32) -> CanFrame {
    let raw = ((ah * 1000.0).round() as u32).to_be_bytes();
    CanFrame::extended(ids::CHARGE_AH_RESPONSE, &raw)
}

pub fn terminal_power(volts: f32, amps: f32) -> CanFrame {
    let mut d = [0u8; 8];
    d[..4].copy_from_slice(&volts.to_be_bytes());
    d[4..].copy_from_slice(&amps.to_be_bytes());
    CanFrame::extended(ids::TERMINAL_POWER, &d)
}

pub fn terminal_status(charging: bool) -> CanFrame {
    let state = if charging { 0x02 } else { 0x01 };
    CanFrame::extended(ids::TERMINAL_STATUS, &[0, 0, 0, 0, 0, 0, 0x03, state])
}

/// Charger-reported output voltage (0x84, raw / 1024).
pub fn charger_voltage(volts: f32) -> CanFrame {
    let raw = ((volts * 1024.0).round() as u32).to_be_bytes();
    CanFrame::extended(
        ids::TELEM_RESPONSE,
        &[0x01, func::OUTPUT_VOLTAGE, 0, 0, raw[0], raw[1], raw[2], raw[3]],
    )
}

/// Charger-reported output current (0x82, tenths).
pub fn charger_current(amps: f32) -> CanFrame {
    let raw = ((amps * 10.0).round() as u16).to_be_bytes();
    CanFrame::extended(
        ids::TELEM_RESPONSE,
        &[0x01, func::OUTPUT_CURRENT, 0, 0, 0, 0, raw[0], raw[1]],
    )
}

pub fn heartbeat(alive: bool) -> CanFrame {
    let flags = if alive { 0x08 } else { 0x00 };
    CanFrame::extended(ids::HEARTBEAT, &[0, 0, 0, 0, flags, 0, 0, 0])
}

// ── Rig ───────────────────────────────────────────────────────

/// A comm thread and a protocol task wired to mocks, driven by hand.
pub struct Rig {
    pub app: AppService,
    pub shared: Arc<CommShared>,
    pub bus: MockBus,
    pub backend: MockBackend,
    pub sink: CollectSink,
    pub bridge: BackendBridge,
    pub client: OfflineBackend,
    pub now: u64,
}

#[allow(dead_code)]
impl Rig {
    pub fn new() -> Self {
        Self::with_config(SystemConfig::default())
    }

    pub fn with_config(config: SystemConfig) -> Self {
        let shared = Arc::new(CommShared::new(&config));
        let mut sink = CollectSink::default();
        let mut app = AppService::new(config.clone(), Arc::clone(&shared));
        app.start(0, &mut sink);
        Self {
            app,
            bridge: BackendBridge::new(config, Arc::clone(&shared)),
            shared,
            bus: MockBus::new(),
            backend: MockBackend::default(),
            sink,
            client: OfflineBackend::new(),
            now: 0,
        }
    }

    pub fn push(&self, bus: BusId, frame: CanFrame) {
        self.shared.ring(bus).push(frame);
    }

    pub fn feed_bms(&self, volts: f32, amps: f32, safe: bool) {
        self.push(BusId::Bms, bms_limits(volts, amps, safe));
    }

    /// Terminal power plus the two other quorum frames.
    pub fn feed_charger(&self, volts: f32, amps: f32) {
        self.push(BusId::Charger, terminal_power(volts, amps));
        self.push(BusId::Charger, terminal_status(amps > 0.0));
        self.push(BusId::Charger, heartbeat(true));
    }

    pub fn tick_at(&mut self, now: u64) {
        self.now = now;
        self.app.tick(now, &mut self.bus, &mut self.backend, &mut self.sink);
    }

    /// Feed a healthy BMS and charger, then tick.
    pub fn step(&mut self, now: u64, volts: f32, amps: f32) {
        self.feed_bms(80.0, 50.0, true);
        self.feed_charger(volts, amps);
        self.tick_at(now);
    }

    pub fn command(&mut self, cmd: AppCommand) {
        self.app
            .handle_command(cmd, self.now, &mut self.bus, &mut self.backend, &mut self.sink);
    }

    /// Hand queued requests to the offline backend and apply its answers.
    pub fn pump_backend(&mut self) {
        let pending = self.backend.take_pending();
        self.bridge.pump(self.now, &mut self.client, pending);
    }

    /// Connect, start locally, and run until the charger is enabled.
    /// Returns the time of the last tick.
    pub fn open_session(&mut self) -> u64 {
        self.step(1000, 75.0, 0.0);
        self.command(AppCommand::OperatorStart);
        self.pump_backend();
        for now in [1300, 1600, 1900] {
            self.step(now, 75.0, 0.0);
        }
        assert!(self.app.gate_open(), "gate should be open after a local start");
        assert_eq!(self.app.last_enable(), Some(true));
        1900
    }
}

impl Default for Rig {
    fn default() -> Self {
        Self::new()
    }
}
