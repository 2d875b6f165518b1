//! One-shot timers driven by a shared tick thread.
//!
//! A [`Timer`] is armed with a duration and a callback. The process-wide
//! [`manager::TimerManager`] runs a single tick thread that measures elapsed
//! wall time with [`minstant::Instant`] and feeds the delta to every live
//! timer; a timer whose remaining time reaches zero fires its callback once
//! and disarms. Restart it from the callback if periodic behavior is wanted.

pub mod manager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use self::manager::TimerManager;

type TimerCallback = Box<dyn Fn() + Send + Sync>;

pub(crate) struct TimerState {
    duration: Duration,
    remaining: Mutex<Duration>,
    running: AtomicBool,
    callback: TimerCallback,
}

impl TimerState {
    /// Advances the timer by `delta`. The fire decision is made under the
    /// lock but the callback runs outside it, so a callback may call
    /// `start`/`stop` on its own timer without deadlocking.
    pub(crate) fn tick(&self, delta: Duration) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let fired = {
            let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
            match remaining.checked_sub(delta) {
                Some(left) if !left.is_zero() => {
                    *remaining = left;
                    false
                }
                _ => {
                    *remaining = Duration::ZERO;
                    // Disarm before the callback so a restart from inside it
                    // is not immediately clobbered.
                    self.running.store(false, Ordering::Release);
                    true
                }
            }
        };
        if fired {
            (self.callback)();
        }
    }
}

/// A restartable one-shot timer.
///
/// The callback runs on the manager's tick thread; keep it short.
pub struct Timer {
    state: Arc<TimerState>,
}

impl Timer {
    /// Creates a disarmed timer and registers it with the tick thread.
    #[must_use]
    pub fn new<F>(duration: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let state = Arc::new(TimerState {
            duration,
            remaining: Mutex::new(duration),
            running: AtomicBool::new(false),
            callback: Box::new(callback),
        });
        TimerManager::global().register(&state);
        Self { state }
    }

    /// Arms the timer with its full duration. Restarting a running timer
    /// resets the countdown.
    pub fn start(&self) {
        {
            let mut remaining = self
                .state
                .remaining
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *remaining = self.state.duration;
        }
        self.state.running.store(true, Ordering::Release);
    }

    /// Disarms the timer without firing.
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
    }

    /// Equivalent to [`Timer::start`]; reads better at call sites that
    /// push back an already-armed deadline.
    pub fn reset(&self) {
        self.start();
    }

    /// Whether the timer is currently armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        TimerManager::global().deregister(&self.state);
    }
}
