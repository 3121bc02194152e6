//! Integration tests for the receive → decide → transmit pipeline.
//!
//! Frames go in through the rings, the comm loop runs against mock
//! adapters, and the tests assert on what reached the buses, the backend
//! and the event sink.

use evse_controller::app::commands::AppCommand;
use evse_controller::app::events::AppEvent;
use evse_controller::app::ports::{Alert, BackendClient, BackendRequest, ConfigPort, IdTag};
use evse_controller::adapters::nvs::NvsAdapter;
use evse_controller::can::{BusId, BusState, CanFrame, ids};
use evse_controller::config::SystemConfig;
use evse_controller::connectivity::{DisconnectCause, Evidence};
use evse_controller::error::SafetyFault;
use evse_controller::gate::{CloseReason, StopReason};
use evse_controller::health::HealthState;

use std::sync::{Arc, mpsc};

use crate::mock_hw::{Rig, charge_ah, charger_current, charger_voltage, terminal_power};

// ── Session start ─────────────────────────────────────────────

#[test]
fn local_start_opens_gate_and_enables_charger() {
    let mut rig = Rig::new();
    rig.open_session();

    assert!(rig.sink.contains(&AppEvent::Connected(Evidence::BmsVoltage)));
    assert!(rig.sink.contains(&AppEvent::GateOpened { transaction_id: Some(1) }));
    // Boot writes "disabled" once, the session flips it exactly once.
    assert_eq!(rig.bus.enables(), vec![false, true]);
    assert_eq!(
        rig.backend.requests.first(),
        Some(&BackendRequest::Start(IdTag::try_from("LOCAL").unwrap()))
    );
}

#[test]
fn setpoints_follow_bms_limits_while_open() {
    let mut rig = Rig::new();
    rig.open_session();

    let setpoints: Vec<(u8, u32)> = rig
        .bus
        .sent(BusId::Charger)
        .iter()
        .filter(|f| f.id() == ids::CTRL_REQUEST && f.data()[1] != ids::func::ENABLE)
        .map(|f| {
            let d = f.data();
            (d[1], u32::from_be_bytes([d[4], d[5], d[6], d[7]]))
        })
        .collect();
    // 80.0 V × 1024 and 50.0 A × 30.5
    assert_eq!(setpoints, vec![(0x00, 81_920), (0x03, 1525)]);
}

#[test]
fn operator_start_rejected_without_battery() {
    let mut rig = Rig::new();
    rig.tick_at(1000);
    rig.command(AppCommand::OperatorStart);

    assert!(rig.sink.contains(&AppEvent::StartRejected("battery not connected")));
    assert!(rig.backend.requests.is_empty());
}

// ── Forced closes ─────────────────────────────────────────────

#[test]
fn bms_permit_withdrawal_stops_charger_in_same_tick() {
    let mut rig = Rig::new();
    rig.open_session();

    rig.feed_bms(80.0, 50.0, false);
    rig.tick_at(2000);

    assert!(rig.sink.contains(&AppEvent::GateClosed(CloseReason::BmsUnsafe)));
    assert_eq!(rig.bus.enables().last(), Some(&false));
    assert_eq!(rig.backend.stops(), vec![StopReason::EmergencyStop]);
    assert_eq!(rig.backend.alerts(), vec![Alert::BmsUnsafe]);
    assert!(!rig.app.gate_open());
}

#[test]
fn emergency_stop_writes_disable_before_next_tick() {
    let mut rig = Rig::new();
    rig.open_session();
    let before = rig.bus.calls.len();

    rig.command(AppCommand::EmergencyStop);

    assert_eq!(rig.bus.calls.len(), before + 1, "exactly one immediate frame");
    assert_eq!(rig.bus.enables().last(), Some(&false));
    assert_eq!(rig.app.last_enable(), Some(false));
    assert!(rig.sink.contains(&AppEvent::GateClosed(CloseReason::EmergencyStop)));
    assert_eq!(rig.backend.stops(), vec![StopReason::Local]);
}

#[test]
fn emergency_stop_holds_while_store_is_busy() {
    let mut rig = Rig::new();
    let now = rig.open_session();

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let shared = Arc::clone(&rig.shared);
        std::thread::spawn(move || {
            shared
                .store
                .with(|_| {
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
                .unwrap();
        })
    };
    locked_rx.recv().unwrap();
    rig.command(AppCommand::EmergencyStop);
    release_tx.send(()).unwrap();
    holder.join().unwrap();

    assert_eq!(rig.bus.enables(), vec![false, true, false]);

    // Several control periods, fresh frames throughout.
    for t in (1..=12).map(|i| now + i * 100) {
        rig.step(t, 75.0, 0.0);
    }
    assert_eq!(rig.bus.enables(), vec![false, true, false], "charger must stay disabled");
    assert_eq!(rig.app.last_enable(), Some(false));
    assert!(!rig.app.gate_open());
    assert_eq!(
        rig.sink.count(|e| *e == AppEvent::GateClosed(CloseReason::EmergencyStop)),
        1
    );
    assert_eq!(rig.backend.stops(), vec![StopReason::Local]);
    let inputs = rig.shared.store.with(|s| s.gate.inputs).unwrap();
    assert!(!inputs.authorized && !inputs.hw_enabled);
}

#[test]
fn stop_request_ends_offline_transaction() {
    let mut rig = Rig::new();
    rig.open_session();
    rig.command(AppCommand::EmergencyStop);
    rig.pump_backend();

    let tx_active = rig.shared.store.with(|s| s.gate.inputs.tx_active).unwrap();
    assert!(!tx_active);
    assert!(!rig.client.is_charging_authorized());
}

// ── Connectivity ──────────────────────────────────────────────

#[test]
fn zero_current_session_is_declared_disconnected() {
    let mut rig = Rig::new();
    let mut now = rig.open_session();
    while now < 8000 {
        now += 100;
        rig.step(now, 75.0, 0.0);
    }

    let cause = DisconnectCause::ZeroCurrent;
    assert_eq!(rig.sink.count(|e| *e == AppEvent::Disconnected(cause)), 1);
    assert!(rig.sink.contains(&AppEvent::GateClosed(CloseReason::EvDisconnected(cause))));
    assert_eq!(rig.backend.stops(), vec![StopReason::EvDisconnected]);
    assert_eq!(rig.backend.alerts(), vec![Alert::EvDisconnected(cause)]);
}

#[test]
fn flowing_current_keeps_session_open() {
    let mut rig = Rig::new();
    let mut now = rig.open_session();
    while now < 8000 {
        now += 100;
        rig.step(now, 80.0, 10.0);
    }

    assert!(rig.app.gate_open());
    assert_eq!(rig.sink.count(|e| matches!(e, AppEvent::Disconnected(_))), 0);
    let wh = rig.shared.store.with(|s| s.energy.wh()).unwrap();
    // 800 W for about 6 s.
    assert!(wh > 1.2 && wh < 1.4, "energy {wh}");
}

#[test]
fn silent_bms_disconnects() {
    let mut rig = Rig::new();
    rig.open_session();

    // Charger keeps reporting, BMS goes quiet after 1900.  The terminal
    // reading sits above its band so it neither counts as evidence nor
    // looks like a collapse.
    let mut now = 1900;
    while now < 6000 {
        now += 100;
        rig.feed_charger(90.0, 0.0);
        rig.tick_at(now);
    }

    assert!(rig.sink.contains(&AppEvent::Disconnected(DisconnectCause::BmsSilent)));
    assert!(!rig.app.gate_open());
    assert_eq!(rig.backend.stops(), vec![StopReason::EvDisconnected]);
}

#[test]
fn terminal_voltage_collapse_disconnects_once() {
    let mut rig = Rig::new();
    let mut now = rig.open_session();
    while now < 3000 {
        now += 100;
        rig.step(now, 80.0, 10.0);
    }
    assert!(rig.app.gate_open());

    // 80 V to 40 V within one evaluation window.
    while now < 4500 {
        now += 100;
        rig.step(now, 40.0, 0.0);
    }

    let cause = DisconnectCause::VoltageCollapse;
    assert_eq!(rig.sink.count(|e| *e == AppEvent::Disconnected(cause)), 1);
    assert!(rig.sink.contains(&AppEvent::GateClosed(CloseReason::EvDisconnected(cause))));
    assert!(!rig.app.gate_open());
    assert_eq!(rig.backend.stops(), vec![StopReason::EvDisconnected]);
}

// ── Charger health ────────────────────────────────────────────

#[test]
fn charger_silence_goes_offline_and_closes_gate() {
    let mut rig = Rig::new();
    rig.open_session();

    rig.feed_bms(80.0, 50.0, true);
    rig.tick_at(5000);

    assert!(rig.sink.contains(&AppEvent::HealthChanged {
        from: HealthState::Healthy,
        to: HealthState::Offline,
    }));
    assert!(rig.sink.contains(&AppEvent::GateClosed(CloseReason::ChargerOffline)));
    assert_eq!(rig.backend.faults(), vec![true]);
    assert_eq!(rig.backend.stops(), vec![StopReason::Other]);
    assert_eq!(rig.backend.alerts(), vec![Alert::ChargerOffline]);
    assert_ne!(rig.app.fault_flags() & SafetyFault::ChargerOffline.mask(), 0);
}

#[test]
fn charger_recovery_clears_fault_without_reopening() {
    let mut rig = Rig::new();
    rig.open_session();
    rig.feed_bms(80.0, 50.0, true);
    rig.tick_at(5000);

    rig.step(5100, 75.0, 0.0);

    assert_eq!(rig.backend.faults(), vec![true, false]);
    assert!(!rig.app.gate_open());
}

// ── Bus supervision ───────────────────────────────────────────

#[test]
fn bus_off_closes_gate_and_recovers_after_cooldown() {
    let mut rig = Rig::new();
    rig.open_session();

    rig.bus.set_state(BusId::Charger, BusState::BusOff);
    rig.bus.reinit_ok = false;
    rig.step(2000, 75.0, 0.0);

    assert!(rig.sink.contains(&AppEvent::BusDown {
        bus: BusId::Charger,
        state: BusState::BusOff,
    }));
    assert!(rig.sink.contains(&AppEvent::GateClosed(CloseReason::BusOff(BusId::Charger))));
    assert_eq!(rig.backend.alerts(), vec![Alert::BusOff(BusId::Charger)]);
    assert_eq!(rig.bus.reinits(BusId::Charger), 1, "first attempt is immediate");

    rig.step(3000, 75.0, 0.0);
    assert_eq!(rig.bus.reinits(BusId::Charger), 1, "cooldown holds");

    rig.bus.reinit_ok = true;
    rig.step(7000, 75.0, 0.0);
    assert_eq!(rig.bus.reinits(BusId::Charger), 2);
    assert!(rig.sink.contains(&AppEvent::BusRecovered(BusId::Charger)));

    // The enable state is re-sent after reinitialisation.
    for now in [7300, 7600, 7900] {
        rig.step(now, 75.0, 0.0);
    }
    assert_eq!(rig.app.last_enable(), Some(false));
    assert_eq!(rig.bus.enables().last(), Some(&false));
}

// ── BMS bus output ────────────────────────────────────────────

#[test]
fn feedback_frame_reports_charger_output() {
    let mut rig = Rig::new();
    rig.push(BusId::Charger, charger_voltage(72.0));
    rig.push(BusId::Charger, charger_current(20.0));
    // The terminal reading is not what the BMS is told.
    rig.push(BusId::Charger, terminal_power(10.0, 1.0));
    rig.tick_at(1000);

    let feedback: Vec<CanFrame> = rig
        .bus
        .sent(BusId::Bms)
        .into_iter()
        .filter(|f| f.id() == ids::CHARGER_FEEDBACK)
        .collect();
    assert_eq!(feedback.len(), 1);
    // 720 and 200 tenths
    assert_eq!(&feedback[0].data()[..4], &[0x02, 0xD0, 0x00, 0xC8]);
    assert_eq!(&feedback[0].data()[5..], &[0, 0, 0]);

    let sent = rig.bus.sent(BusId::Bms);
    assert!(sent.iter().any(|f| f.id() == ids::CHARGE_AH_REQUEST));
    assert!(sent.iter().any(|f| f.id() == ids::DISCHARGE_AH_REQUEST));
}

#[test]
fn feedback_flags_battery_missing_before_connect() {
    let mut rig = Rig::new();
    rig.tick_at(1000);

    let frame = rig
        .bus
        .sent(BusId::Bms)
        .into_iter()
        .find(|f| f.id() == ids::CHARGER_FEEDBACK)
        .unwrap();
    // Not connected and no BMS frame yet.
    assert_eq!(frame.data()[4], 0x08 | 0x10);
}

#[test]
fn charge_total_publishes_soc() {
    let mut rig = Rig::new();
    rig.feed_bms(80.0, 50.0, true);
    rig.push(BusId::Bms, charge_ah(30.0));
    rig.tick_at(1000);

    let soc = rig
        .sink
        .events
        .iter()
        .find_map(|e| match e {
            AppEvent::SocUpdated(s) => Some(*s),
            _ => None,
        })
        .unwrap();
    // 50 A limit selects the 60 Ah tier.
    assert_eq!(soc.capacity_ah, 60.0);
    assert_eq!(soc.percent, 50.0);
}

#[test]
fn unknown_frames_are_counted_not_decoded() {
    let mut rig = Rig::new();
    rig.push(BusId::Charger, CanFrame::extended(0x0123_4567, &[0; 8]));
    rig.push(BusId::Bms, CanFrame::extended(ids::CHARGER_FEEDBACK, &[0; 8]));
    rig.tick_at(1000);

    assert_eq!(rig.shared.diag.unknown_frames(), 2);
}

// ── Configuration ─────────────────────────────────────────────

#[test]
fn runtime_config_change_is_saved_after_delay() {
    let mut rig = Rig::new();
    let nvs = NvsAdapter::new().unwrap();
    let cfg = SystemConfig {
        health_quorum: 3,
        ..Default::default()
    };

    rig.now = 1000;
    rig.command(AppCommand::UpdateConfig(cfg.clone()));
    assert!(!rig.app.auto_save_if_needed(3000, &nvs));
    assert!(rig.app.auto_save_if_needed(6000, &nvs));
    assert_eq!(nvs.load().unwrap(), cfg);
}

#[test]
fn invalid_runtime_config_is_ignored() {
    let mut rig = Rig::new();
    let cfg = SystemConfig {
        health_quorum: 9,
        ..Default::default()
    };
    rig.command(AppCommand::UpdateConfig(cfg));
    assert!(!rig.app.is_config_dirty());
    assert_eq!(rig.app.config(), &SystemConfig::default());
}
