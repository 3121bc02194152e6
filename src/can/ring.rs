//! Fixed-capacity receive ring, one per bus.
//!
//! The receiver thread pushes, the comm thread drains.  On overflow the
//! oldest frame is discarded: every value on both buses is re-polled
//! periodically, so a fresh frame is always worth more than a stale one.
//!
//! The deque lives behind an `embassy-sync` critical-section mutex so the
//! ring can sit in a `static` and be touched from any task without
//! allocation.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Deque;

use super::CanFrame;

/// Frames buffered per bus.
pub const RING_CAPACITY: usize = 64;

pub struct FrameRing {
    frames: Mutex<CriticalSectionRawMutex, RefCell<Deque<CanFrame, RING_CAPACITY>>>,
    received: AtomicU32,
    overwritten: AtomicU32,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub const fn new() -> Self {
        Self {
            frames: Mutex::new(RefCell::new(Deque::new())),
            received: AtomicU32::new(0),
            overwritten: AtomicU32::new(0),
        }
    }

    /// Enqueue a frame, evicting the oldest when full.
    /// Returns `false` if an older frame was dropped to make room.
    pub fn push(&self, frame: CanFrame) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.frames.lock(|cell| {
            let mut q = cell.borrow_mut();
            let mut kept_all = true;
            if q.is_full() {
                q.pop_front();
                self.overwritten.fetch_add(1, Ordering::Relaxed);
                kept_all = false;
            }
            // Cannot fail: a slot was freed above if needed.
            let _ = q.push_back(frame);
            kept_all
        })
    }

    /// Dequeue the oldest frame.
    pub fn pop(&self) -> Option<CanFrame> {
        self.frames.lock(|cell| cell.borrow_mut().pop_front())
    }

    /// Pop up to `max` frames into `handler`, oldest first.
    ///
    /// The critical section is released between frames so the receiver is
    /// never held off for a whole drain.
    pub fn drain(&self, max: usize, mut handler: impl FnMut(CanFrame)) -> usize {
        let mut n = 0;
        while n < max {
            let Some(frame) = self.pop() else { break };
            handler(frame);
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.frames.lock(|cell| cell.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill level in percent, for the periodic bus status line.
    pub fn fill_percent(&self) -> u8 {
        (self.len() * 100 / RING_CAPACITY) as u8
    }

    /// Frames ever pushed.
    pub fn received(&self) -> u32 {
        self.received.load(Ordering::Relaxed)
    }

    /// Frames evicted unread.
    pub fn overwritten(&self) -> u32 {
        self.overwritten.load(Ordering::Relaxed)
    }
}
