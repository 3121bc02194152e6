//! Receiver threads: controller → [`FrameRing`].
//!
//! One thread per bus.  Each frame is stamped with the monotonic clock at
//! the moment it leaves the controller, then pushed into that bus's ring.
//! Nothing here decodes or locks the shared store.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use embedded_hal::digital::InputPin;
use embedded_hal::spi::SpiDevice;
use log::{debug, info};

use crate::can::{BusId, CanFrame, FrameRing};
use crate::drivers::mcp2515::Mcp2515;
use crate::drivers::twai::Twai;

/// Frames moved per wake-up before yielding.
pub const RX_BATCH: usize = 16;
/// How long a receiver blocks waiting for the first frame of a batch.
pub const RX_WAIT_MS: u32 = 10;

/// Anything that can hand over received frames.
pub trait FrameSource {
    /// Wait up to `timeout_ms` for the next frame.
    fn next_frame(&mut self, timeout_ms: u32) -> Option<CanFrame>;
}

impl FrameSource for Arc<Twai> {
    fn next_frame(&mut self, timeout_ms: u32) -> Option<CanFrame> {
        self.receive(timeout_ms)
    }
}

/// MCP2515 source: checks the INT line, then drains the receive buffers
/// under the device lock shared with the comm thread's transmit path.
pub struct McpSource<SPI, INT> {
    device: Arc<Mutex<Mcp2515<SPI>>>,
    int: INT,
}

impl<SPI, INT> McpSource<SPI, INT> {
    pub fn new(device: Arc<Mutex<Mcp2515<SPI>>>, int: INT) -> Self {
        Self { device, int }
    }
}

impl<SPI: SpiDevice, INT: InputPin> McpSource<SPI, INT> {
    fn poll_device(&mut self) -> Option<CanFrame> {
        // INT is active-low; a read error falls through to a poll.
        if !self.int.is_low().unwrap_or(true) {
            return None;
        }
        let mut dev = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        match dev.receive() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("CAN_RX | BMS read failed: {:?}", e);
                None
            }
        }
    }
}

impl<SPI: SpiDevice, INT: InputPin> FrameSource for McpSource<SPI, INT> {
    fn next_frame(&mut self, timeout_ms: u32) -> Option<CanFrame> {
        let mut waited = 0;
        loop {
            if let Some(frame) = self.poll_device() {
                return Some(frame);
            }
            if waited >= timeout_ms {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
    }
}

/// Move up to `max` frames from `source` into `ring`.  Only the first
/// read may block.
pub fn receive_batch(
    source: &mut impl FrameSource,
    ring: &FrameRing,
    now_ms: impl Fn() -> u64,
    max: usize,
    timeout_ms: u32,
) -> usize {
    let mut moved = 0;
    let mut wait = timeout_ms;
    while moved < max {
        let Some(frame) = source.next_frame(wait) else {
            break;
        };
        ring.push(frame.with_timestamp(now_ms()));
        moved += 1;
        wait = 0;
    }
    moved
}

/// Receiver thread body.  Never returns.
pub fn run(bus: BusId, mut source: impl FrameSource, ring: &FrameRing, now_ms: impl Fn() -> u64) -> ! {
    info!("CAN_RX | {bus} receiver running");
    loop {
        if receive_batch(&mut source, ring, &now_ms, RX_BATCH, RX_WAIT_MS) == RX_BATCH {
            std::thread::yield_now();
        }
    }
}
