//! Thread-pool task scheduler with repeated tasks and stop hooks.
//!
//! One-shot jobs run on a fixed pool of worker threads; repeated jobs each
//! get a dedicated thread that reruns the job on an interval. [`stop`]
//! lets workers drain jobs already queued, wakes repeated threads so they
//! exit immediately, runs registered stop callbacks exactly once, and arms
//! a watchdog that aborts the process if any scheduler thread is still
//! alive after [`SHUTDOWN_GRACE`]. [`wait`] blocks the caller until that
//! whole sequence has completed.
//!
//! [`stop`]: TaskScheduler::stop
//! [`wait`]: TaskScheduler::wait

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::timing::Timer;

/// How long `stop` waits for scheduler threads before aborting the process.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send + 'static>;
type StopCallback = Box<dyn FnOnce() + Send + 'static>;

struct SchedulerInner {
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    /// Repeated threads park on this pair between runs so `stop` can wake
    /// them immediately instead of waiting out the interval.
    sleep_lock: Mutex<()>,
    sleep_wake: Condvar,
    stopping: AtomicBool,
    live_threads: AtomicUsize,
    stop_callbacks: Mutex<Vec<StopCallback>>,
    /// Flipped once the whole shutdown sequence has finished; `wait`ers
    /// block on this pair.
    done: Mutex<bool>,
    done_signal: Condvar,
}

/// Decrements the live-thread count however the thread exits.
struct LivenessGuard(Arc<SchedulerInner>);

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.0.live_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Creates a scheduler with one worker per available CPU.
    #[must_use]
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
        Self::with_workers(workers)
    }

    /// Creates a scheduler with exactly `workers` pool threads.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or a thread cannot be spawned.
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        assert!(workers > 0, "scheduler needs at least one worker");
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            sleep_lock: Mutex::new(()),
            sleep_wake: Condvar::new(),
            stopping: AtomicBool::new(false),
            live_threads: AtomicUsize::new(0),
            stop_callbacks: Mutex::new(Vec::new()),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let inner = Arc::clone(&inner);
            inner.live_threads.fetch_add(1, Ordering::AcqRel);
            let handle = std::thread::Builder::new()
                .name(format!("sched-worker-{n}"))
                .spawn(move || worker_loop(&inner))
                .expect("spawning scheduler worker");
            handles.push(handle);
        }
        debug!(workers, "task scheduler started");

        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Queues a one-shot job for the pool. Jobs submitted after `stop` are
    /// dropped.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.stopping.load(Ordering::Acquire) {
            warn!("one-shot job submitted to a stopped scheduler, dropping");
            return;
        }
        let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(Box::new(job));
        drop(queue);
        self.inner.work_ready.notify_one();
    }

    /// Runs `job` now and then again every `interval` on a dedicated thread
    /// until the scheduler stops.
    pub fn spawn_repeated<F>(&self, name: &str, interval: Duration, job: F)
    where
        F: Fn() + Send + 'static,
    {
        if self.inner.stopping.load(Ordering::Acquire) {
            warn!(name, "repeated job submitted to a stopped scheduler, dropping");
            return;
        }
        let inner = Arc::clone(&self.inner);
        inner.live_threads.fetch_add(1, Ordering::AcqRel);
        let handle = std::thread::Builder::new()
            .name(format!("sched-{name}"))
            .spawn(move || repeated_loop(&inner, interval, job))
            .expect("spawning repeated task thread");
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Registers a callback to run exactly once when the scheduler stops,
    /// before its threads are joined.
    pub fn on_stop<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .stop_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Stops the scheduler and joins its threads. Idempotent; later calls
    /// return immediately.
    ///
    /// A watchdog timer aborts the process if threads are still alive after
    /// [`SHUTDOWN_GRACE`], so a wedged job cannot hang shutdown forever.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stopping task scheduler");
        self.inner.work_ready.notify_all();
        self.inner.sleep_wake.notify_all();

        let callbacks = std::mem::take(
            &mut *self
                .inner
                .stop_callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for callback in callbacks {
            callback();
        }

        let watchdog = {
            let inner = Arc::clone(&self.inner);
            Timer::new(SHUTDOWN_GRACE, move || {
                let live = inner.live_threads.load(Ordering::Acquire);
                if live > 0 {
                    error!(live, "scheduler threads failed to stop in time, aborting");
                    std::process::abort();
                }
            })
        };
        watchdog.start();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        let current = std::thread::current().id();
        for handle in handles {
            // A stop issued from inside a job cannot join its own thread.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("scheduler thread panicked during shutdown");
            }
        }
        watchdog.stop();
        *self.inner.done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.inner.done_signal.notify_all();
        debug!("task scheduler stopped");
    }

    /// Blocks until a `stop()` has run to completion: stop callbacks fired
    /// and scheduler threads joined. Callable before or during `stop()`,
    /// from any thread; returns immediately once shutdown has finished.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self
                .inner
                .done_signal
                .wait(done)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: &Arc<SchedulerInner>) {
    let _guard = LivenessGuard(Arc::clone(inner));
    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if inner.stopping.load(Ordering::Acquire) {
                    break None;
                }
                queue = inner
                    .work_ready
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        match job {
            Some(job) => run_job(job),
            None => break,
        }
    }
}

fn repeated_loop<F>(inner: &Arc<SchedulerInner>, interval: Duration, job: F)
where
    F: Fn() + Send + 'static,
{
    let _guard = LivenessGuard(Arc::clone(inner));
    while !inner.stopping.load(Ordering::Acquire) {
        if panic::catch_unwind(AssertUnwindSafe(&job)).is_err() {
            error!("repeated job panicked");
        }
        let sleep = inner.sleep_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _unused = inner
            .sleep_wake
            .wait_timeout_while(sleep, interval, |()| {
                !inner.stopping.load(Ordering::Acquire)
            })
            .unwrap_or_else(|e| e.into_inner());
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("one-shot job panicked");
    }
}
