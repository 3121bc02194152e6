//! Runtime diagnostics.
//!
//! Data-plane errors never abort anything; they are absorbed and counted
//! here.  The counters are plain atomics so the receiver, comm and
//! protocol threads can bump them without taking the store lock.
//!
//! [`RuntimeMetrics`] is a serialisable snapshot logged with the periodic
//! bus status line.

use core::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

use crate::can::BusId;

/// Process-wide error counters.
pub struct DiagnosticsCounters {
    /// Frames rejected by a dialect decoder (short, not extended, bad function).
    decode_rejected: AtomicU32,
    /// Frames with an arbitration ID not handled on their bus.
    unknown_frames: AtomicU32,
    /// Decoded frames dropped because the store lock timed out.
    decode_dropped: AtomicU32,
    /// Enable commands skipped because the gate could not be read.
    enable_skipped: AtomicU32,
    tx_failures: [AtomicU32; 2],
    bus_recoveries: [AtomicU32; 2],
}

impl Default for DiagnosticsCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsCounters {
    pub const fn new() -> Self {
        Self {
            decode_rejected: AtomicU32::new(0),
            unknown_frames: AtomicU32::new(0),
            decode_dropped: AtomicU32::new(0),
            enable_skipped: AtomicU32::new(0),
            tx_failures: [AtomicU32::new(0), AtomicU32::new(0)],
            bus_recoveries: [AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    pub fn record_decode_rejected(&self) {
        self.decode_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_frame(&self) {
        self.unknown_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_dropped(&self) {
        self.decode_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enable_skipped(&self) {
        self.enable_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx_failure(&self, bus: BusId) {
        self.tx_failures[bus.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_recovery(&self, bus: BusId) {
        self.bus_recoveries[bus.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_rejected(&self) -> u32 {
        self.decode_rejected.load(Ordering::Relaxed)
    }

    pub fn unknown_frames(&self) -> u32 {
        self.unknown_frames.load(Ordering::Relaxed)
    }

    pub fn decode_dropped(&self) -> u32 {
        self.decode_dropped.load(Ordering::Relaxed)
    }

    pub fn enable_skipped(&self) -> u32 {
        self.enable_skipped.load(Ordering::Relaxed)
    }

    pub fn tx_failures(&self, bus: BusId) -> u32 {
        self.tx_failures[bus.index()].load(Ordering::Relaxed)
    }

    pub fn bus_recoveries(&self, bus: BusId) -> u32 {
        self.bus_recoveries[bus.index()].load(Ordering::Relaxed)
    }
}

/// Runtime diagnostics snapshot collected on-demand.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeMetrics {
    pub uptime_secs: u64,
    pub comm_cycles: u64,
    pub heap_free: u32,
    pub heap_min_free: u32,
    pub lock_timeouts: u32,
    pub decode_rejected: u32,
    pub unknown_frames: u32,
    pub decode_dropped: u32,
    pub enable_skipped: u32,
    pub ring_overwritten: [u32; 2],
    pub tx_failures: [u32; 2],
    pub bus_recoveries: [u32; 2],
    pub energy_discarded: u32,
}

/// Counters that live outside [`DiagnosticsCounters`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalCounts {
    pub lock_timeouts: u32,
    pub ring_overwritten: [u32; 2],
    pub energy_discarded: u32,
}

impl RuntimeMetrics {
    #[cfg(target_os = "espidf")]
    pub fn collect(
        uptime_secs: u64,
        comm_cycles: u64,
        counters: &DiagnosticsCounters,
        external: ExternalCounts,
    ) -> Self {
        use esp_idf_svc::sys::*;
        let heap_free = unsafe { esp_get_free_heap_size() };
        let heap_min = unsafe { esp_get_minimum_free_heap_size() };
        Self::build(uptime_secs, comm_cycles, heap_free, heap_min, counters, external)
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn collect(
        uptime_secs: u64,
        comm_cycles: u64,
        counters: &DiagnosticsCounters,
        external: ExternalCounts,
    ) -> Self {
        // Synthetic heap figures so simulation exercises the same paths.
        let base_free: u32 = 245_760; // 240 KB
        let decay = (uptime_secs / 60) as u32 * 256;
        let heap_free = base_free.saturating_sub(decay);
        let heap_min_free = (heap_free as f32 * 0.85) as u32;
        Self::build(uptime_secs, comm_cycles, heap_free, heap_min_free, counters, external)
    }

    fn build(
        uptime_secs: u64,
        comm_cycles: u64,
        heap_free: u32,
        heap_min_free: u32,
        c: &DiagnosticsCounters,
        external: ExternalCounts,
    ) -> Self {
        Self {
            uptime_secs,
            comm_cycles,
            heap_free,
            heap_min_free,
            lock_timeouts: external.lock_timeouts,
            decode_rejected: c.decode_rejected(),
            unknown_frames: c.unknown_frames(),
            decode_dropped: c.decode_dropped(),
            enable_skipped: c.enable_skipped(),
            ring_overwritten: external.ring_overwritten,
            tx_failures: BusId::ALL.map(|b| c.tx_failures(b)),
            bus_recoveries: BusId::ALL.map(|b| c.bus_recoveries(b)),
            energy_discarded: external.energy_discarded,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Custom panic handler
// ───────────────────────────────────────────────────────────────

/// Install a panic hook that logs the reason before the default handler
/// aborts.  Must be called once during init, after the logger.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };

        match info.location() {
            Some(loc) => log::error!("PANIC: {} at {}:{}", reason, loc.file(), loc.line()),
            None => log::error!("PANIC: {}", reason),
        }

        #[cfg(target_os = "espidf")]
        {
            // SAFETY: esp_timer_get_time is a plain counter read, safe in
            // panic context.
            let uptime = (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000_000;
            log::error!("PANIC: uptime {}s", uptime);
        }
    }));
}
