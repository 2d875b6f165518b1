//! Lock-free recording buffers for signal events.
//!
//! The producer side runs in the signal-delivery context, so both buffer
//! shapes use only atomic loads and stores, never a lock or an allocation.
//! The consumer side is a single thread calling
//! [`EventBuffer::take`] from normal control flow.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};

/// One received signal: sender pid and the queued machine-word payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub pid: libc::pid_t,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retention {
    /// Keep only the most recent event; older ones are overwritten.
    Latest,
    /// Bounded FIFO; the newest event is dropped when the ring is full.
    Fifo,
}

struct Slot {
    pid: AtomicI32,
    value: AtomicI64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            pid: AtomicI32::new(0),
            value: AtomicI64::new(0),
        }
    }
}

/// Shared between the trampoline (producer) and a handler's `poll`
/// (consumer).
pub struct EventBuffer {
    retention: Retention,
    slots: Box<[Slot]>,
    /// Next slot `take` reads. Fifo only.
    head: AtomicUsize,
    /// Next slot `record` writes. Fifo only.
    tail: AtomicUsize,
    /// Whether the single slot holds an unconsumed event. Latest only.
    armed: AtomicBool,
}

impl EventBuffer {
    /// A single-slot buffer retaining only the most recent event.
    #[must_use]
    pub fn latest() -> Self {
        Self {
            retention: Retention::Latest,
            slots: vec![Slot::empty()].into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
        }
    }

    /// A ring buffer holding up to `capacity` pending events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn fifo(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        // One sentinel slot distinguishes full from empty, so `capacity`
        // events really fit.
        let slots = (0..=capacity).map(|_| Slot::empty()).collect();
        Self {
            retention: Retention::Fifo,
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
        }
    }

    /// Records an event. Called from the signal-delivery context: must stay
    /// lock-free and allocation-free.
    pub fn record(&self, pid: libc::pid_t, value: i64) {
        match self.retention {
            Retention::Latest => {
                self.slots[0].pid.store(pid, Ordering::Relaxed);
                self.slots[0].value.store(value, Ordering::Relaxed);
                self.armed.store(true, Ordering::Release);
            }
            Retention::Fifo => {
                let tail = self.tail.load(Ordering::Relaxed);
                let next = (tail + 1) % self.slots.len();
                if next == self.head.load(Ordering::Acquire) {
                    // Ring full: drop the newest event.
                    return;
                }
                self.slots[tail].pid.store(pid, Ordering::Relaxed);
                self.slots[tail].value.store(value, Ordering::Relaxed);
                self.tail.store(next, Ordering::Release);
            }
        }
    }

    /// Consumes the next pending event, if any.
    pub fn take(&self) -> Option<SignalEvent> {
        match self.retention {
            Retention::Latest => {
                if !self.armed.swap(false, Ordering::AcqRel) {
                    return None;
                }
                Some(SignalEvent {
                    pid: self.slots[0].pid.load(Ordering::Relaxed),
                    value: self.slots[0].value.load(Ordering::Relaxed),
                })
            }
            Retention::Fifo => {
                let head = self.head.load(Ordering::Relaxed);
                if head == self.tail.load(Ordering::Acquire) {
                    return None;
                }
                let event = SignalEvent {
                    pid: self.slots[head].pid.load(Ordering::Relaxed),
                    value: self.slots[head].value.load(Ordering::Relaxed),
                };
                self.head
                    .store((head + 1) % self.slots.len(), Ordering::Release);
                Some(event)
            }
        }
    }
}
