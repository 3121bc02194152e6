//! Outbound polling scheduler.
//!
//! Runs inside the comm thread.  Every tick it decides which request
//! frames are due and writes them through the [`CanBusPort`].
//!
//! ```text
//! ┌───────────────────────── charger bus ─────────────────────────┐
//! │  control group   300 ms  0x32 ─▶ 0x00 ─▶ 0x03 ─▶ 0x32 …       │
//! │  telemetry group 200 ms  0x84 ─▶ 0x82 ─▶ 0x79 ─▶ 0x80 ─▶ 0x83 │
//! └───────────────────────────────────────────────────────────────┘
//! ┌────────────────────────── BMS bus ────────────────────────────┐
//! │  feedback        100 ms  charger V / I + status flags         │
//! │  Ah requests    2000 ms  charge, discharge                    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The enable command (0x32) is edge-triggered: it is written only when
//! the gate decision differs from the last value the charger accepted.
//! Setpoints follow the BMS limits and are sent only while the gate is
//! open.  Telemetry queries go out regardless of gate state.

use log::{debug, info, warn};

use crate::app::ports::CanBusPort;
use crate::can::ids::{self, func};
use crate::can::{BusId, CanFrame};
use crate::config::SystemConfig;
use crate::diagnostics::DiagnosticsCounters;
use crate::gate::GatePolicy;
use crate::protocol::bms::{self, Feedback};
use crate::protocol::charger;
use crate::store::{SharedStore, StoreState};

// ═══════════════════════════════════════════════════════════════
//  Polling groups
// ═══════════════════════════════════════════════════════════════

/// A request/response group served round-robin, one function per period.
#[derive(Debug, Clone, Copy)]
pub struct PollingGroup {
    pub label: &'static str,
    pub request_id: u32,
    pub response_id: u32,
    pub functions: &'static [u8],
}

pub const CONTROL_GROUP: PollingGroup = PollingGroup {
    label: "control",
    request_id: ids::CTRL_REQUEST,
    response_id: ids::CTRL_RESPONSE,
    functions: func::CONTROL_GROUP,
};

pub const TELEMETRY_GROUP: PollingGroup = PollingGroup {
    label: "telemetry",
    request_id: ids::TELEM_REQUEST,
    response_id: ids::TELEM_RESPONSE,
    functions: func::TELEMETRY_GROUP,
};

/// Round-robin position within one group.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    index: usize,
    last_sent_ms: Option<u64>,
}

impl Cursor {
    fn current(&self, group: &PollingGroup) -> u8 {
        group.functions[self.index % group.functions.len()]
    }

    fn advance(&mut self, group: &PollingGroup) {
        self.index = (self.index + 1) % group.functions.len();
    }
}

pub(crate) fn due(last_ms: Option<u64>, now_ms: u64, period_ms: u32) -> bool {
    last_ms.is_none_or(|t| now_ms.saturating_sub(t) >= u64::from(period_ms))
}

// ═══════════════════════════════════════════════════════════════
//  Per-tick inputs and outputs
// ═══════════════════════════════════════════════════════════════

/// Values the scheduler reads from the store, under one lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSnapshot {
    pub gate_open: bool,
    /// BMS limits, once any limits frame has been seen.
    pub bms_limits: Option<(f32, f32)>,
    /// Output as the charger reports it (0x84 / 0x82), echoed to the BMS.
    pub charger_volts: f32,
    pub charger_amps: f32,
}

impl PollSnapshot {
    pub fn capture(s: &StoreState, policy: GatePolicy) -> Self {
        let t = &s.telemetry;
        Self {
            gate_open: s.gate_view().is_open(policy),
            bms_limits: t
                .bms_max_voltage
                .updated_ms()
                .map(|_| (t.bms_max_voltage.get(), t.bms_max_current.get())),
            charger_volts: t.charger_voltage.get(),
            charger_amps: t.charger_current.get(),
        }
    }
}

/// What one tick put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Enable value the charger accepted this tick.
    pub enable_sent: Option<bool>,
    pub transmitted: u8,
    pub failed: u8,
}

impl PollReport {
    fn record(&mut self, ok: bool) {
        if ok {
            self.transmitted += 1;
        } else {
            self.failed += 1;
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Scheduler engine
// ═══════════════════════════════════════════════════════════════

/// Outbound request scheduler.  Owned by the comm thread.
#[derive(Debug, Clone, Default)]
pub struct PollingScheduler {
    control: Cursor,
    telemetry: Cursor,
    /// Last enable value the charger bus accepted.
    last_enable: Option<bool>,
    last_feedback_ms: Option<u64>,
    last_ah_ms: Option<u64>,
    /// Enable slot writes "disabled" whatever the gate says.
    hold_disabled: bool,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_enable(&self) -> Option<bool> {
        self.last_enable
    }

    /// Forget the last accepted enable value so the next control slot
    /// re-sends it.  Used after a charger bus reinitialisation.
    pub fn invalidate_enable(&mut self) {
        self.last_enable = None;
    }

    /// Latch the enable slot to "disabled" until released.  Used while an
    /// emergency stop could not yet be written to the store.
    pub fn hold_disabled(&mut self, hold: bool) {
        self.hold_disabled = hold;
    }

    pub fn is_holding_disabled(&self) -> bool {
        self.hold_disabled
    }

    /// Write the enable command right away, outside the round-robin.
    /// Used by the emergency-stop path.
    pub fn push_enable_now(
        &mut self,
        enable: bool,
        bus: &mut impl CanBusPort,
        diag: &DiagnosticsCounters,
    ) -> bool {
        match bus.transmit(BusId::Charger, &charger::enable_command(enable)) {
            Ok(()) => {
                info!("Charger output {} (immediate)", if enable { "ENABLED" } else { "DISABLED" });
                self.last_enable = Some(enable);
                true
            }
            Err(e) => {
                warn!("Immediate enable write failed: {e}");
                diag.record_tx_failure(BusId::Charger);
                false
            }
        }
    }

    /// Run one scheduling pass.
    pub fn tick(
        &mut self,
        now_ms: u64,
        store: &SharedStore,
        cfg: &SystemConfig,
        feedback_flags: u8,
        bus: &mut impl CanBusPort,
        diag: &DiagnosticsCounters,
    ) -> PollReport {
        let mut report = PollReport::default();
        let policy = GatePolicy::from_config(cfg);

        let control_due = due(self.control.last_sent_ms, now_ms, cfg.control_group_period_ms);
        let feedback_due = due(self.last_feedback_ms, now_ms, cfg.feedback_interval_ms);
        let snapshot = if control_due || feedback_due {
            store.with(|s| PollSnapshot::capture(s, policy)).ok()
        } else {
            None
        };

        if control_due {
            self.control_slot(now_ms, snapshot, bus, diag, &mut report);
        }

        if due(self.telemetry.last_sent_ms, now_ms, cfg.telemetry_group_period_ms) {
            let function = self.telemetry.current(&TELEMETRY_GROUP);
            let frame = charger::query(TELEMETRY_GROUP.request_id, function);
            report.record(send(bus, BusId::Charger, &frame, diag));
            self.telemetry.advance(&TELEMETRY_GROUP);
            self.telemetry.last_sent_ms = Some(now_ms);
        }

        if feedback_due {
            self.last_feedback_ms = Some(now_ms);
            if let Some(snap) = snapshot {
                let frame = Feedback {
                    volts: snap.charger_volts,
                    amps: snap.charger_amps,
                    flags: feedback_flags,
                }
                .to_frame();
                report.record(send(bus, BusId::Bms, &frame, diag));
            }
        }

        if due(self.last_ah_ms, now_ms, cfg.ah_request_interval_ms) {
            self.last_ah_ms = Some(now_ms);
            report.record(send(bus, BusId::Bms, &bms::charge_ah_request(), diag));
            report.record(send(bus, BusId::Bms, &bms::discharge_ah_request(), diag));
        }

        report
    }

    // ── Internal ──────────────────────────────────────────────────

    fn control_slot(
        &mut self,
        now_ms: u64,
        snapshot: Option<PollSnapshot>,
        bus: &mut impl CanBusPort,
        diag: &DiagnosticsCounters,
        report: &mut PollReport,
    ) {
        self.control.last_sent_ms = Some(now_ms);
        let function = self.control.current(&CONTROL_GROUP);

        let Some(snap) = snapshot else {
            if function == func::ENABLE {
                // Gate unknown: try again next period from the same slot.
                debug!("Enable slot skipped: store busy");
                diag.record_enable_skipped();
            } else {
                self.control.advance(&CONTROL_GROUP);
            }
            return;
        };
        self.control.advance(&CONTROL_GROUP);

        match function {
            func::ENABLE => {
                let want = snap.gate_open && !self.hold_disabled;
                if self.last_enable == Some(want) {
                    return;
                }
                let ok = send(bus, BusId::Charger, &charger::enable_command(want), diag);
                report.record(ok);
                if ok {
                    info!("Charger output {}", if want { "ENABLED" } else { "DISABLED" });
                    self.last_enable = Some(want);
                    report.enable_sent = Some(want);
                }
            }
            func::VOLTAGE_LIMIT | func::CURRENT_LIMIT => {
                let open = snap.gate_open && !self.hold_disabled;
                let (true, Some((volts, amps))) = (open, snap.bms_limits) else {
                    return;
                };
                let raw = if function == func::VOLTAGE_LIMIT {
                    charger::voltage_setpoint_raw(volts)
                } else {
                    charger::current_setpoint_raw(amps)
                };
                let frame = charger::setpoint_request(function, raw);
                report.record(send(bus, BusId::Charger, &frame, diag));
            }
            _ => {}
        }
    }
}

fn send(bus: &mut impl CanBusPort, id: BusId, frame: &CanFrame, diag: &DiagnosticsCounters) -> bool {
    match bus.transmit(id, frame) {
        Ok(()) => true,
        Err(e) => {
            debug!("TX 0x{:08X} failed: {e}", frame.id());
            diag.record_tx_failure(id);
            false
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::BusState;
    use crate::error::BusError;
    use crate::protocol::charger::TerminalPower;

    #[derive(Default)]
    struct RecordingBus {
        sent: Vec<(BusId, CanFrame)>,
        fail_charger: bool,
    }

    impl RecordingBus {
        fn enables(&self) -> Vec<bool> {
            self.sent
                .iter()
                .filter(|(_, f)| f.id() == ids::CTRL_REQUEST && f.data()[1] == func::ENABLE)
                .map(|(_, f)| f.data()[3] == 0x00)
                .collect()
        }

        fn count(&self, id: u32) -> usize {
            self.sent.iter().filter(|(_, f)| f.id() == id).count()
        }
    }

    impl CanBusPort for RecordingBus {
        fn transmit(&mut self, bus: BusId, frame: &CanFrame) -> Result<(), BusError> {
            if self.fail_charger && bus == BusId::Charger {
                return Err(BusError::TransmitFailed(bus));
            }
            self.sent.push((bus, *frame));
            Ok(())
        }

        fn bus_state(&mut self, _bus: BusId) -> BusState {
            BusState::Running
        }

        fn reinitialize(&mut self, _bus: BusId) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn open_store(cfg: &SystemConfig) -> SharedStore {
        let store = SharedStore::from_config(cfg);
        store
            .with(|s| {
                s.gate.transaction_started(1);
                s.gate.inputs.bms_safe = true;
                s.connectivity.mark_connected(0);
                s.telemetry.bms_max_voltage.set(84.0, 0);
                s.telemetry.bms_max_current.set(50.0, 0);
            })
            .unwrap();
        store
    }

    /// Run ticks every 50 ms over `[from, to)`.
    fn run(
        sched: &mut PollingScheduler,
        store: &SharedStore,
        bus: &mut RecordingBus,
        diag: &DiagnosticsCounters,
        from: u64,
        to: u64,
    ) {
        let cfg = SystemConfig::default();
        let mut t = from;
        while t < to {
            sched.tick(t, store, &cfg, 0, bus, diag);
            t += 50;
        }
    }

    #[test]
    fn enable_is_edge_triggered() {
        let cfg = SystemConfig::default();
        let store = open_store(&cfg);
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();

        // Ten control periods with the gate steady open.
        run(&mut sched, &store, &mut bus, &diag, 0, 3000);
        assert_eq!(bus.enables(), vec![true]);

        store.with(|s| s.gate.close()).unwrap();
        run(&mut sched, &store, &mut bus, &diag, 3000, 6000);
        assert_eq!(bus.enables(), vec![true, false]);
    }

    #[test]
    fn setpoints_only_while_open() {
        let cfg = SystemConfig::default();
        let store = SharedStore::from_config(&cfg);
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();

        run(&mut sched, &store, &mut bus, &diag, 0, 3000);
        let setpoints = bus
            .sent
            .iter()
            .filter(|(_, f)| f.id() == ids::CTRL_REQUEST && f.data()[1] != func::ENABLE)
            .count();
        assert_eq!(setpoints, 0);
        // Disable went out once; telemetry never stopped.
        assert_eq!(bus.enables(), vec![false]);
        assert!(bus.count(ids::TELEM_REQUEST) >= 14);

        let store = open_store(&cfg);
        let mut bus = RecordingBus::default();
        run(&mut sched, &store, &mut bus, &diag, 3000, 4000);
        let voltage = bus
            .sent
            .iter()
            .find(|(_, f)| f.id() == ids::CTRL_REQUEST && f.data()[1] == func::VOLTAGE_LIMIT)
            .map(|(_, f)| *f)
            .unwrap();
        // 84 V × 1024
        assert_eq!(&voltage.data()[4..8], &86_016u32.to_be_bytes());
    }

    #[test]
    fn failed_enable_is_retried() {
        let cfg = SystemConfig::default();
        let store = open_store(&cfg);
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus {
            fail_charger: true,
            ..Default::default()
        };
        let mut sched = PollingScheduler::new();

        sched.tick(0, &store, &cfg, 0, &mut bus, &diag);
        assert_eq!(sched.last_enable(), None);
        assert!(diag.tx_failures(BusId::Charger) >= 1);

        bus.fail_charger = false;
        // 0x00 and 0x03 first, then the enable slot comes round again.
        run(&mut sched, &store, &mut bus, &diag, 300, 1000);
        assert_eq!(bus.enables(), vec![true]);
        assert_eq!(sched.last_enable(), Some(true));
    }

    #[test]
    fn busy_store_holds_the_enable_slot() {
        use std::sync::{Arc, mpsc};

        let cfg = SystemConfig::default();
        let store = Arc::new(open_store(&cfg));
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store
                    .with(|_| {
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    })
                    .unwrap();
            })
        };
        locked_rx.recv().unwrap();
        sched.tick(0, &store, &cfg, 0, &mut bus, &diag);
        release_tx.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(diag.enable_skipped(), 1);
        assert!(bus.enables().is_empty());

        // Next control period lands on the enable slot again.
        sched.tick(300, &store, &cfg, 0, &mut bus, &diag);
        assert_eq!(bus.enables(), vec![true]);
    }

    #[test]
    fn bms_bus_cadence() {
        let cfg = SystemConfig::default();
        let store = open_store(&cfg);
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();

        run(&mut sched, &store, &mut bus, &diag, 0, 4000);
        assert_eq!(bus.count(ids::CHARGER_FEEDBACK), 40);
        assert_eq!(bus.count(ids::CHARGE_AH_REQUEST), 2);
        assert_eq!(bus.count(ids::DISCHARGE_AH_REQUEST), 2);
    }

    #[test]
    fn invalidate_resends_enable() {
        let cfg = SystemConfig::default();
        let store = open_store(&cfg);
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();

        run(&mut sched, &store, &mut bus, &diag, 0, 1000);
        sched.invalidate_enable();
        run(&mut sched, &store, &mut bus, &diag, 1000, 2000);
        assert_eq!(bus.enables(), vec![true, true]);
    }

    #[test]
    fn push_enable_now_bypasses_round_robin() {
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();
        assert!(sched.push_enable_now(false, &mut bus, &diag));
        assert_eq!(bus.enables(), vec![false]);
        assert_eq!(sched.last_enable(), Some(false));
    }

    #[test]
    fn disable_hold_overrides_open_gate() {
        let cfg = SystemConfig::default();
        let store = open_store(&cfg);
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();

        run(&mut sched, &store, &mut bus, &diag, 0, 1000);
        assert!(sched.push_enable_now(false, &mut bus, &diag));
        sched.hold_disabled(true);

        // Gate still reads open in the store.
        let before = bus.sent.len();
        run(&mut sched, &store, &mut bus, &diag, 1000, 3000);
        assert_eq!(bus.enables(), vec![true, false]);
        let setpoints = bus.sent[before..]
            .iter()
            .filter(|(_, f)| f.id() == ids::CTRL_REQUEST)
            .count();
        assert_eq!(setpoints, 0);

        sched.hold_disabled(false);
        run(&mut sched, &store, &mut bus, &diag, 3000, 4000);
        assert_eq!(bus.enables(), vec![true, false, true]);
    }

    #[test]
    fn feedback_echoes_charger_reported_output() {
        let cfg = SystemConfig::default();
        let store = open_store(&cfg);
        store
            .with(|s| {
                s.telemetry.charger_voltage.set(72.0, 0);
                s.telemetry.charger_current.set(20.0, 0);
                s.telemetry.terminal.set(TerminalPower { volts: 10.0, amps: 1.0 }, 0);
            })
            .unwrap();
        let diag = DiagnosticsCounters::new();
        let mut bus = RecordingBus::default();
        let mut sched = PollingScheduler::new();

        sched.tick(0, &store, &cfg, bms::flags::OVER_TEMPERATURE, &mut bus, &diag);
        let (_, fb) = bus
            .sent
            .iter()
            .find(|(b, f)| *b == BusId::Bms && f.id() == ids::CHARGER_FEEDBACK)
            .unwrap();
        assert_eq!(fb.data(), &[0x02, 0xD0, 0x00, 0xC8, 0x02, 0, 0, 0]);
    }
}
