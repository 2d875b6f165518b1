//! The process-wide tick thread behind [`crate::timing::Timer`].

use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use minstant::Instant;
use tracing::trace;

use super::TimerState;

/// Interval between tick-thread wakeups.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Registry of live timers, advanced by a single background thread.
///
/// Timers are held as weak references; a dropped [`crate::timing::Timer`]
/// stops being ticked without any coordination with the thread, and dead
/// entries are swept on the next registration.
pub struct TimerManager {
    timers: RwLock<Vec<Weak<TimerState>>>,
}

impl TimerManager {
    /// The singleton instance. The tick thread is spawned on first use and
    /// lives for the rest of the process.
    pub(crate) fn global() -> &'static TimerManager {
        static GLOBAL: OnceLock<TimerManager> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let manager = TimerManager {
                timers: RwLock::new(Vec::new()),
            };
            std::thread::Builder::new()
                .name("timer-tick".into())
                .spawn(tick_loop)
                .expect("spawning the timer tick thread");
            manager
        })
    }

    pub(crate) fn register(&self, state: &Arc<TimerState>) {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        timers.retain(|weak| weak.strong_count() > 0);
        timers.push(Arc::downgrade(state));
        trace!(live = timers.len(), "timer registered");
    }

    pub(crate) fn deregister(&self, state: &Arc<TimerState>) {
        let target = Arc::as_ptr(state);
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        timers.retain(|weak| weak.as_ptr() != target && weak.strong_count() > 0);
    }

    fn advance(&self, delta: Duration) {
        let timers = self.timers.read().unwrap_or_else(|e| e.into_inner());
        for weak in timers.iter() {
            if let Some(state) = weak.upgrade() {
                state.tick(delta);
            }
        }
    }
}

fn tick_loop() {
    let mut last = Instant::now();
    loop {
        std::thread::sleep(TICK_INTERVAL);
        let now = Instant::now();
        let delta = now.duration_since(last);
        last = now;
        TimerManager::global().advance(delta);
    }
}
