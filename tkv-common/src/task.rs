//! # Periodic Background Tasks
//!
//! Purpose: Run a closure on a fixed cycle in a dedicated thread, with a
//! cooperative stop signal checked once per tick.
//!
//! ## Design Principles
//! 1. **Polling, Not Events**: The loop sleeps in short ticks and checks a flag,
//!    so stopping never interrupts an in-flight run of the closure.
//! 2. **Owned Shutdown**: `TaskHandle` joins the thread on `stop` or on drop, so
//!    tests and shutdown paths never leak threads.
//! 3. **Immediate First Run**: The closure runs once on start, then after every
//!    full interval.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest single sleep between stop-flag checks.
const MAX_TICK: Duration = Duration::from_millis(100);

/// Spawner for periodic background loops (pool sweep, cache sweep, health probe).
pub struct PeriodicTask;

impl PeriodicTask {
    /// Starts `work` on a named thread, running it now and then every `interval`.
    ///
    /// A zero interval is clamped to 1ms. Thread spawn failures are logged and
    /// yield a handle with no thread attached.
    pub fn spawn<F>(name: &str, interval: Duration, mut work: F) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };
        let tick = interval.min(MAX_TICK);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);

        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut last_run = Instant::now();
                work();
                while !stop_thread.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    if stop_thread.load(Ordering::Acquire) {
                        break;
                    }
                    if last_run.elapsed() >= interval {
                        last_run = Instant::now();
                        work();
                    }
                }
            });

        let join = match spawned {
            Ok(join) => Some(join),
            Err(err) => {
                tracing::warn!(task = name, error = %err, "failed to spawn background task");
                None
            }
        };

        TaskHandle {
            name: name.to_string(),
            stop,
            join,
        }
    }
}

/// Handle for a running periodic task.
///
/// Call `stop` to signal shutdown and join the thread.
pub struct TaskHandle {
    name: String,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Returns the thread name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true while the background thread has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.join.is_some() && !self.stop.load(Ordering::Acquire)
    }

    /// Stops the task and waits for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            // A task stopping itself (e.g. dispose from inside the loop) must not self-join.
            if join.thread().id() == std::thread::current().id() {
                return;
            }
            if join.join().is_err() {
                tracing::warn!(task = %self.name, "background task panicked");
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
