//! EVSE Charge Controller Firmware — Main Entry Point
//!
//! Hexagonal architecture, four pinned threads sharing one store.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  DualBusAdapter    LogEventSink   NvsAdapter   Esp32Time       │
//! │  (CanBusPort)      (EventSink)    (ConfigPort)                 │
//! │  QueuedBackend     OfflineBackend                              │
//! │  (BackendPort)     (BackendClient)                             │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              AppService (comm thread)                  │    │
//! │  │  decode · connectivity · health · gate · polling       │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  can-rx ×2 ──▶ FrameRing ×2     console ──▶ COMMANDS           │
//! │  comm ──▶ BACKEND_REQUESTS ──▶ ocpp (BackendBridge)            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};

use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{AnyIOPin, AnyInputPin, AnyOutputPin, PinDriver, Pull};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::spi::{SpiDeviceDriver, SpiDriver, SpiDriverConfig, config::Config as SpiConfig};
use esp_idf_hal::units::Hertz;

use evse_controller::adapters::backend::{OfflineBackend, QueuedBackend};
use evse_controller::adapters::can_bus::DualBusAdapter;
use evse_controller::adapters::log_sink::LogEventSink;
use evse_controller::adapters::nvs::NvsAdapter;
use evse_controller::adapters::time::Esp32TimeAdapter;
use evse_controller::app::ports::ConfigPort;
use evse_controller::app::service::{AppService, CommShared};
use evse_controller::backend::BackendBridge;
use evse_controller::can::BusId;
use evse_controller::channels::{BACKEND_REQUESTS, COMMANDS};
use evse_controller::config::SystemConfig;
use evse_controller::drivers::can_rx::{self, McpSource};
use evse_controller::drivers::mcp2515::Mcp2515;
use evse_controller::drivers::task_pin::{Core, spawn_on_core};
use evse_controller::drivers::twai::Twai;
use evse_controller::{console, diagnostics, pins};

/// Protocol task cadence.
const OCPP_POLL_MS: u64 = 100;
/// Console poll interval when stdin has nothing.
const UI_IDLE_MS: u64 = 50;

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  EVSE controller v{}               ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    diagnostics::install_panic_handler();

    // ── 2. Load config from NVS (or defaults) ─────────────────
    let nvs = match NvsAdapter::new() {
        Ok(n) => Some(n),
        Err(e) => {
            // Run without persistence; NVS should self-heal on next boot.
            warn!("NVS init failed ({}), running with defaults and no persistence", e);
            None
        }
    };
    let config = match nvs.as_ref().map(|n| n.load()) {
        Some(Ok(cfg)) => {
            info!("Config loaded from NVS");
            cfg
        }
        Some(Err(e)) => {
            warn!("NVS config load failed ({}), using defaults", e);
            SystemConfig::default()
        }
        None => SystemConfig::default(),
    };

    let clock = Esp32TimeAdapter::new();
    let shared = Arc::new(CommShared::new(&config));

    // ── 3. Charger bus: on-chip TWAI ──────────────────────────
    let twai = Arc::new(Twai::new(pins::TWAI_TX_GPIO, pins::TWAI_RX_GPIO));
    if let Err(e) = twai.start() {
        // Bus supervision retries after the recovery cooldown.
        warn!("TWAI start failed: {}", e);
    }

    // ── 4. BMS bus: MCP2515 on SPI ────────────────────────────
    let peripherals = Peripherals::take()?;
    // SAFETY: each GPIO number from `pins` is claimed exactly once, here.
    let (sck, mosi, miso, cs, int) = unsafe {
        (
            AnyIOPin::new(pins::MCP_SCK_GPIO),
            AnyIOPin::new(pins::MCP_MOSI_GPIO),
            AnyIOPin::new(pins::MCP_MISO_GPIO),
            AnyOutputPin::new(pins::MCP_CS_GPIO),
            AnyInputPin::new(pins::MCP_INT_GPIO),
        )
    };
    let spi = SpiDriver::new(peripherals.spi2, sck, mosi, Some(miso), &SpiDriverConfig::new())?;
    let spi = SpiDeviceDriver::new(spi, Some(cs), &SpiConfig::new().baudrate(Hertz(pins::MCP_SPI_HZ)))?;
    let mut int = PinDriver::input(int)?;
    int.set_pull(Pull::Up)?;

    let mcp = Arc::new(Mutex::new(Mcp2515::new(spi)));
    if let Ok(mut dev) = mcp.lock() {
        if let Err(e) = dev.init(&mut FreeRtos) {
            warn!("MCP2515 init failed: {:?}", e);
        }
    }

    // ── 5. Receiver threads ───────────────────────────────────
    {
        let shared = Arc::clone(&shared);
        let source = Arc::clone(&twai);
        spawn_on_core(Core::App, 5, 4, "can-rx-chg\0", move || {
            can_rx::run(BusId::Charger, source, shared.ring(BusId::Charger), || clock.now_ms())
        })?;
    }
    {
        let shared = Arc::clone(&shared);
        let source = McpSource::new(Arc::clone(&mcp), int);
        spawn_on_core(Core::App, 5, 4, "can-rx-bms\0", move || {
            can_rx::run(BusId::Bms, source, shared.ring(BusId::Bms), || clock.now_ms())
        })?;
    }

    // ── 6. Protocol task ──────────────────────────────────────
    {
        let mut bridge = BackendBridge::new(config.clone(), Arc::clone(&shared));
        spawn_on_core(Core::Pro, 3, 8, "ocpp\0", move || {
            let mut client = OfflineBackend::new();
            loop {
                let pending = core::iter::from_fn(|| BACKEND_REQUESTS.try_receive().ok());
                bridge.pump(clock.now_ms(), &mut client, pending);
                std::thread::sleep(Duration::from_millis(OCPP_POLL_MS));
            }
        })?;
    }

    // ── 7. Operator console ───────────────────────────────────
    spawn_on_core(Core::Pro, 2, 4, "ui\0", || {
        info!("CONSOLE | {}", console::HELP);
        let mut buf = [0u8; 16];
        let mut stdin = std::io::stdin();
        loop {
            match stdin.read(&mut buf) {
                Ok(n) if n > 0 => {
                    console::feed(&buf[..n], |cmd| {
                        if let Err(e) = COMMANDS.try_send(cmd) {
                            warn!("CONSOLE | command queue full, dropped {:?}", e);
                        }
                    });
                }
                _ => std::thread::sleep(Duration::from_millis(UI_IDLE_MS)),
            }
        }
    })?;

    // ── 8. Comm thread ────────────────────────────────────────
    let comm = spawn_on_core(Core::App, 4, 8, "comm\0", move || {
        let period = Duration::from_millis(u64::from(config.comm_loop_interval_ms));
        let mut app = AppService::new(config, shared);
        let mut bus = DualBusAdapter::new(twai, mcp, FreeRtos);
        let mut backend = QueuedBackend::new(&BACKEND_REQUESTS);
        let mut sink = LogEventSink::new();

        app.start(clock.now_ms(), &mut sink);
        info!("System ready. Entering comm loop.");

        loop {
            let now = clock.now_ms();
            while let Ok(cmd) = COMMANDS.try_receive() {
                app.handle_command(cmd, now, &mut bus, &mut backend, &mut sink);
            }
            app.tick(now, &mut bus, &mut backend, &mut sink);
            if let Some(nvs) = &nvs {
                app.auto_save_if_needed(now, nvs);
            }
            std::thread::sleep(period);
        }
    })?;

    if comm.join().is_err() {
        error!("comm thread died, restarting");
        // SAFETY: plain reboot request.
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
    Ok(())
}
