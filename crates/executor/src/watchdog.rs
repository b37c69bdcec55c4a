// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watchdog timer for supervised interpreter runs.
//!
//! Fires a callback once if not stopped within the timeout. The fired
//! flag stays readable after the run so the supervisor can tell a timeout
//! kill apart from an external abort.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct State {
    stopped: bool,
    timed_out: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// One-shot timer running on its own thread.
pub struct Watchdog {
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the timer. `on_timeout` runs on the watchdog thread if the
    /// timeout elapses before [`stop`](Self::stop).
    pub fn start<F>(timeout: Duration, on_timeout: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::new(Inner {
            state: Mutex::new(State { stopped: false, timed_out: false }),
            cond: Condvar::new(),
        });
        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || run(thread_inner, timeout, on_timeout));
        let handle = match handle {
            Ok(h) => Some(h),
            Err(error) => {
                tracing::error!(%error, "failed to spawn watchdog thread");
                None
            }
        };
        Self { inner, handle }
    }

    /// Stop the timer without firing. Idempotent; joins the timer thread.
    pub fn stop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
        }
        self.inner.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Whether the timer fired.
    pub fn timed_out(&self) -> bool {
        self.inner.state.lock().timed_out
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F: FnOnce()>(inner: Arc<Inner>, timeout: Duration, on_timeout: F) {
    let deadline = Instant::now() + timeout;
    let mut state = inner.state.lock();
    while !state.stopped {
        if inner.cond.wait_until(&mut state, deadline).timed_out() {
            break;
        }
    }
    // A stop that lands exactly at the deadline wins.
    if state.stopped {
        return;
    }
    state.timed_out = true;
    drop(state);
    on_timeout();
}

#[cfg(test)]
#[path = "watchdog_tests.rs"]
mod tests;
