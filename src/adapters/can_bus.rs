//! Dual-bus CAN adapter.
//!
//! Implements [`CanBusPort`] over the two controllers:
//!
//! ```text
//!  BusId::Charger ──▶ Twai (on-chip, IDF driver)
//!  BusId::Bms     ──▶ Mcp2515 (SPI) behind a mutex shared with its receiver
//! ```
//!
//! Driver errors are folded into [`BusError`] so the comm loop sees one
//! error vocabulary for both buses.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;

use crate::app::ports::CanBusPort;
use crate::can::{BusId, BusState, CanFrame};
use crate::drivers::mcp2515::{Mcp2515, Mcp2515Error};
use crate::drivers::twai::Twai;
use crate::error::BusError;

/// How long a charger-bus transmit may wait for a TX queue slot.
const TWAI_TX_TIMEOUT_MS: u32 = 5;

/// Driver code reported for an SPI failure talking to the MCP2515.
const SPI_FAILURE: i32 = -1;

pub struct DualBusAdapter<SPI, D> {
    charger: Arc<Twai>,
    bms: Arc<Mutex<Mcp2515<SPI>>>,
    delay: D,
}

impl<SPI: SpiDevice, D: DelayNs> DualBusAdapter<SPI, D> {
    pub fn new(charger: Arc<Twai>, bms: Arc<Mutex<Mcp2515<SPI>>>, delay: D) -> Self {
        Self { charger, bms, delay }
    }

    fn bms(&self) -> MutexGuard<'_, Mcp2515<SPI>> {
        self.bms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn map_mcp<E>(e: Mcp2515Error<E>) -> BusError {
    match e {
        Mcp2515Error::TxBusy => BusError::TransmitFailed(BusId::Bms),
        Mcp2515Error::ModeTimeout(_) => BusError::NotStarted(BusId::Bms),
        Mcp2515Error::Spi(_) => BusError::Driver(BusId::Bms, SPI_FAILURE),
    }
}

impl<SPI: SpiDevice, D: DelayNs> CanBusPort for DualBusAdapter<SPI, D> {
    fn transmit(&mut self, bus: BusId, frame: &CanFrame) -> Result<(), BusError> {
        match bus {
            BusId::Charger => self.charger.transmit(frame, TWAI_TX_TIMEOUT_MS),
            BusId::Bms => self.bms().transmit(frame).map_err(map_mcp),
        }
    }

    fn bus_state(&mut self, bus: BusId) -> BusState {
        match bus {
            BusId::Charger => self.charger.state(),
            BusId::Bms => self.bms().state().unwrap_or(BusState::Stopped),
        }
    }

    fn reinitialize(&mut self, bus: BusId) -> Result<(), BusError> {
        match bus {
            BusId::Charger => self.charger.restart(),
            BusId::Bms => {
                let mut dev = self.bms.lock().unwrap_or_else(PoisonError::into_inner);
                dev.init(&mut self.delay).map_err(map_mcp)
            }
        }
    }
}
