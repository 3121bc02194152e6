//! ESP32 on-chip TWAI controller (charger bus).
//!
//! Thin wrapper over the ESP-IDF TWAI driver: 250 kbit/s, normal mode,
//! accept-all filter (the charger bus carries only our module's frames).
//! All calls take `&self` because the IDF driver is a process-wide
//! singleton with its own locking; the receiver thread blocks in
//! [`Twai::receive`] while the comm thread transmits and supervises.
//!
//! - **`target_os = "espidf"`**: `twai_driver_install` / `twai_start` /
//!   `twai_transmit` / `twai_receive` / `twai_get_status_info`.
//! - **`not(target_os = "espidf")`**: an in-memory controller that records
//!   transmitted frames and replays injected ones, for host tests.

use crate::can::{BusId, BusState, CanFrame};
use crate::error::BusError;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const TX_QUEUE_LEN: u32 = 8;
const RX_QUEUE_LEN: u32 = 32;

/// Error counter level at which the controller turns error-passive.
const ERROR_PASSIVE_LEVEL: u32 = 128;

pub struct Twai {
    #[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
    tx_gpio: i32,
    #[cfg_attr(not(target_os = "espidf"), allow(dead_code))]
    rx_gpio: i32,
    #[cfg(not(target_os = "espidf"))]
    sim: std::sync::Mutex<SimController>,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Debug)]
struct SimController {
    state: BusState,
    rx: std::collections::VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    starts: u32,
}

impl Twai {
    pub fn new(tx_gpio: i32, rx_gpio: i32) -> Self {
        Self {
            tx_gpio,
            rx_gpio,
            #[cfg(not(target_os = "espidf"))]
            sim: std::sync::Mutex::new(SimController {
                state: BusState::Stopped,
                rx: std::collections::VecDeque::new(),
                sent: Vec::new(),
                starts: 0,
            }),
        }
    }

    /// Stop and uninstall (errors ignored: the driver may already be
    /// gone), then install and start again.  Used both at boot and for
    /// bus-off recovery.
    pub fn restart(&self) -> Result<(), BusError> {
        self.shutdown();
        self.start()
    }
}

// ═══════════════════════════════════════════════════════════════
//  ESP-IDF backend
// ═══════════════════════════════════════════════════════════════

#[cfg(target_os = "espidf")]
fn ms_to_ticks(ms: u32) -> TickType_t {
    ((u64::from(ms) * u64::from(configTICK_RATE_HZ)) / 1000) as TickType_t
}

#[cfg(target_os = "espidf")]
impl Twai {
    pub fn start(&self) -> Result<(), BusError> {
        let general = twai_general_config_t {
            mode: twai_mode_t_TWAI_MODE_NORMAL,
            tx_io: self.tx_gpio,
            rx_io: self.rx_gpio,
            clkout_io: -1,
            bus_off_io: -1,
            tx_queue_len: TX_QUEUE_LEN,
            rx_queue_len: RX_QUEUE_LEN,
            alerts_enabled: TWAI_ALERT_NONE,
            clkout_divider: 0,
            intr_flags: ESP_INTR_FLAG_LEVEL1 as i32,
            ..Default::default()
        };
        // 80 MHz APB / 16 = 5 MHz quanta, 1 + 15 + 4 = 20 quanta per bit.
        let timing = twai_timing_config_t {
            brp: 16,
            tseg_1: 15,
            tseg_2: 4,
            sjw: 3,
            triple_sampling: false,
            ..Default::default()
        };
        let filter = twai_filter_config_t {
            acceptance_code: 0,
            acceptance_mask: 0xFFFF_FFFF,
            single_filter: true,
        };

        // SAFETY: the config structs outlive the call; the driver copies them.
        let ret = unsafe { twai_driver_install(&general, &timing, &filter) };
        if ret != ESP_OK {
            return Err(BusError::Driver(BusId::Charger, ret));
        }
        let ret = unsafe { twai_start() };
        if ret != ESP_OK {
            return Err(BusError::Driver(BusId::Charger, ret));
        }
        log::info!(
            "TWAI: started at 250 kbit/s (tx=GPIO{}, rx=GPIO{})",
            self.tx_gpio,
            self.rx_gpio
        );
        Ok(())
    }

    fn shutdown(&self) {
        // SAFETY: both calls validate driver state and return an error
        // code when there is nothing to stop or uninstall.
        unsafe {
            twai_stop();
            twai_driver_uninstall();
        }
    }

    pub fn transmit(&self, frame: &CanFrame, timeout_ms: u32) -> Result<(), BusError> {
        let mut msg = twai_message_t::default();
        if frame.is_extended() {
            msg.__bindgen_anon_1.flags = TWAI_MSG_FLAG_EXTD;
        }
        msg.identifier = frame.id();
        msg.data_length_code = frame.dlc();
        msg.data[..frame.data().len()].copy_from_slice(frame.data());

        // SAFETY: `msg` is a fully initialised message on our stack.
        match unsafe { twai_transmit(&msg, ms_to_ticks(timeout_ms)) } {
            ESP_OK => Ok(()),
            ESP_ERR_INVALID_STATE => Err(self.not_running_error()),
            ESP_ERR_TIMEOUT | ESP_FAIL => Err(BusError::TransmitFailed(BusId::Charger)),
            e => Err(BusError::Driver(BusId::Charger, e)),
        }
    }

    /// Block up to `timeout_ms` for one frame.
    pub fn receive(&self, timeout_ms: u32) -> Option<CanFrame> {
        let mut msg = twai_message_t::default();
        // SAFETY: `msg` is a valid out-parameter.
        let ret = unsafe { twai_receive(&mut msg, ms_to_ticks(timeout_ms)) };
        if ret != ESP_OK {
            if ret == ESP_ERR_INVALID_STATE {
                // Driver mid-restart; avoid spinning.
                std::thread::sleep(std::time::Duration::from_millis(u64::from(timeout_ms.max(1))));
            }
            return None;
        }
        // SAFETY: `flags` is the plain-integer view of the bitfield union.
        let extended = unsafe { msg.__bindgen_anon_1.flags } & TWAI_MSG_FLAG_EXTD != 0;
        let len = usize::from(msg.data_length_code).min(8);
        let data = &msg.data[..len];
        Some(if extended {
            CanFrame::extended(msg.identifier, data)
        } else {
            CanFrame::standard(msg.identifier as u16, data)
        })
    }

    pub fn state(&self) -> BusState {
        let mut info = twai_status_info_t::default();
        // SAFETY: `info` is a valid out-parameter.
        if unsafe { twai_get_status_info(&mut info) } != ESP_OK {
            return BusState::Stopped;
        }
        #[allow(non_upper_case_globals)]
        match info.state {
            twai_state_t_TWAI_STATE_RUNNING => {
                if info.tx_error_counter >= ERROR_PASSIVE_LEVEL
                    || info.rx_error_counter >= ERROR_PASSIVE_LEVEL
                {
                    BusState::Degraded
                } else {
                    BusState::Running
                }
            }
            twai_state_t_TWAI_STATE_RECOVERING => BusState::Degraded,
            twai_state_t_TWAI_STATE_BUS_OFF => BusState::BusOff,
            _ => BusState::Stopped,
        }
    }

    fn not_running_error(&self) -> BusError {
        match self.state() {
            BusState::BusOff => BusError::BusOff(BusId::Charger),
            _ => BusError::NotStarted(BusId::Charger),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Simulation backend
// ═══════════════════════════════════════════════════════════════

#[cfg(not(target_os = "espidf"))]
impl Twai {
    fn sim(&self) -> std::sync::MutexGuard<'_, SimController> {
        self.sim.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<(), BusError> {
        let mut sim = self.sim();
        sim.state = BusState::Running;
        sim.starts += 1;
        log::info!("TWAI: simulation backend started");
        Ok(())
    }

    fn shutdown(&self) {
        self.sim().state = BusState::Stopped;
    }

    pub fn transmit(&self, frame: &CanFrame, _timeout_ms: u32) -> Result<(), BusError> {
        let mut sim = self.sim();
        match sim.state {
            BusState::Running | BusState::Degraded => {
                sim.sent.push(*frame);
                Ok(())
            }
            BusState::BusOff => Err(BusError::BusOff(BusId::Charger)),
            BusState::Stopped => Err(BusError::NotStarted(BusId::Charger)),
        }
    }

    pub fn receive(&self, _timeout_ms: u32) -> Option<CanFrame> {
        let mut sim = self.sim();
        if sim.state.needs_recovery() {
            return None;
        }
        sim.rx.pop_front()
    }

    pub fn state(&self) -> BusState {
        self.sim().state
    }

    /// Queue a frame as if it arrived from the bus.
    pub fn sim_inject(&self, frame: CanFrame) {
        self.sim().rx.push_back(frame);
    }

    /// Force the simulated controller state.
    pub fn sim_set_state(&self, state: BusState) {
        self.sim().state = state;
    }

    /// Frames transmitted so far.
    pub fn sim_sent(&self) -> Vec<CanFrame> {
        self.sim().sent.clone()
    }

    /// Number of successful `start` calls.
    pub fn sim_starts(&self) -> u32 {
        self.sim().starts
    }
}
