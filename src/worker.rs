//! Periodic worker threads
//!
//! Both I/O loops of the driver (the receive step and the feedback poll) run
//! on dedicated OS threads with a cooperative stop flag. The tick closure
//! returns whether it made progress: a busy tick loops immediately so bursts
//! drain at full speed, an idle tick sleeps one period.
//!
//! `stop` and `join` must not be called from inside the worker itself; the
//! owner stops the worker, then joins it. Dropping the handle does both.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a periodic worker thread.
pub struct PeriodicWorker {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl PeriodicWorker {
    /// Spawn a named worker running `tick` until stopped.
    ///
    /// `tick` returns `true` when it made progress (the loop continues
    /// immediately) and `false` when it was idle (the loop sleeps `period`).
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop_flag);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    if !tick() {
                        thread::sleep(period);
                    }
                }
                log::debug!("Worker '{}' exiting", thread_name);
            })?;

        Ok(PeriodicWorker {
            stop_flag,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    /// Request the worker to stop. The flag is checked between ticks, so the
    /// worker finishes its current tick (or sleep) first.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Wait for the worker to terminate. Call [`stop`] first, otherwise this
    /// blocks until someone else does.
    ///
    /// [`stop`]: PeriodicWorker::stop
    pub fn join(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| {
                log::error!("Worker '{}' panicked", self.name);
                Error::ThreadPanic
            })?;
        }
        Ok(())
    }

    /// Whether the worker has been joined yet.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}
