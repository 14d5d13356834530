/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Per-operation deadline supervision. Long-running transfer loops feed
//! the watchdog; a starved watchdog consults its timeout handler, and
//! three consecutive strikes tear the session down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Strikes before the watchdog stops asking and terminates.
pub const MAX_STRIKES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Rearm the timer and keep waiting.
    Continue,
    /// Give up: the terminate hook runs and supervision ends.
    Terminate,
}

/// Decides what a lapsed deadline means: `(name, elapsed, strike_count)`.
pub type TimeoutHandler = Box<dyn FnMut(&str, Duration, u32) -> WatchdogVerdict + Send>;

struct Shared {
    last_feed: Mutex<Instant>,
    strikes: AtomicU32,
    stopped: AtomicBool,
}

/// A running watchdog. Dropping it stops supervision.
pub struct Watchdog {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Starts supervising. `on_timeout` is consulted per strike;
    /// `on_terminate` runs once when the verdict is `Terminate` or the
    /// strike budget is spent.
    pub fn start(
        name: impl Into<String>,
        timeout: Duration,
        mut on_timeout: TimeoutHandler,
        on_terminate: impl FnOnce() + Send + 'static,
    ) -> Self {
        let name = name.into();
        let shared = Arc::new(Shared {
            last_feed: Mutex::new(Instant::now()),
            strikes: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        });

        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();

            loop {
                let deadline = {
                    let last = *task_shared.last_feed.lock().await;
                    last + timeout
                };

                tokio::time::sleep_until(deadline.into()).await;

                if task_shared.stopped.load(Ordering::SeqCst) {
                    return;
                }

                let last = *task_shared.last_feed.lock().await;
                if last + timeout > Instant::now() {
                    // Fed while we slept.
                    continue;
                }

                let strikes = task_shared.strikes.fetch_add(1, Ordering::SeqCst) + 1;
                let elapsed = started.elapsed();
                warn!("watchdog '{name}': strike {strikes}/{MAX_STRIKES} after {elapsed:?}");

                let verdict = on_timeout(&name, elapsed, strikes);
                if verdict == WatchdogVerdict::Terminate || strikes >= MAX_STRIKES {
                    warn!("watchdog '{name}': terminating the session");
                    on_terminate();
                    return;
                }

                // Rearm with a fresh window.
                *task_shared.last_feed.lock().await = Instant::now();
            }
        });

        Watchdog { shared, task }
    }

    /// Resets the deadline and the strike count. Required at least every
    /// `timeout / 3` during long transfers.
    pub fn feed(&self) {
        self.shared.strikes.store(0, Ordering::SeqCst);
        if let Ok(mut last) = self.shared.last_feed.try_lock() {
            *last = Instant::now();
        }
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
