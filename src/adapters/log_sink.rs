//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing structured application events to
//! the ESP-IDF logger (which goes to UART / USB-CDC in production).
//! Each line starts with a tag so the serial log can be grepped per
//! subsystem.

use log::{info, warn};

use crate::app::events::AppEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`AppEvent`] to the serial console.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Telemetry(t) => {
                info!(
                    "TELEM | gate={} batt={} gun={} | BMS {:.1}V/{:.1}A safe={} | \
                     chg {:.2}V/{:.1}A {:.1}\u{00b0}C {} | term {:.2}V/{:.2}A | \
                     soc={:?} | {:.1}Wh | faults=0b{:08b}",
                    if t.gate_open { "OPEN" } else { "closed" },
                    t.battery_connected,
                    t.gun_connected,
                    t.bms_max_voltage,
                    t.bms_max_current,
                    t.bms_safe,
                    t.charger_voltage,
                    t.charger_current,
                    t.charger_temperature_c,
                    t.charger_health,
                    t.terminal_voltage,
                    t.terminal_current,
                    t.soc_percent,
                    t.energy_wh,
                    t.fault_flags,
                );
            }
            AppEvent::Started => info!("START | comm loop running"),
            AppEvent::Connected(evidence) => info!("CONN | connected via {:?}", evidence),
            AppEvent::Disconnected(cause) => warn!("CONN | disconnected: {}", cause),
            AppEvent::GateOpened { transaction_id } => {
                info!("GATE | open, transaction={:?}", transaction_id);
            }
            AppEvent::GateClosed(reason) => warn!("GATE | closed: {}", reason),
            AppEvent::EnableSent(on) => {
                info!("GATE | charger output {}", if *on { "ENABLED" } else { "DISABLED" });
            }
            AppEvent::HealthChanged { from, to } => info!("HEALTH | {} -> {}", from, to),
            AppEvent::FaultDetected(flags) => warn!("FAULT | detected, flags=0b{:08b}", flags),
            AppEvent::FaultCleared => info!("FAULT | all cleared"),
            AppEvent::SocUpdated(soc) => info!(
                "SOC | {:.1}% {:.1}/{:.0}Ah ~{:.0}km ({:?})",
                soc.percent, soc.battery_ah, soc.capacity_ah, soc.range_km, soc.class
            ),
            AppEvent::BusDown { bus, state } => warn!("BUS | {} down ({:?})", bus, state),
            AppEvent::BusRecovered(bus) => info!("BUS | {} recovered", bus),
            AppEvent::BusStatus(b) => info!(
                "BUS | {} {:?} | ring {}% rx={} overwritten={} | tx_fail={}",
                b.bus, b.state, b.ring_fill_percent, b.received, b.overwritten, b.tx_failures
            ),
            AppEvent::StartRejected(why) => warn!("GATE | start rejected: {}", why),
        }
    }
}
