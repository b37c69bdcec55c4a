// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;

#[test]
fn fires_after_timeout() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let dog = Watchdog::start(Duration::from_millis(20), move || {
        flag.store(true, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(200));
    assert!(fired.load(Ordering::SeqCst));
    assert!(dog.timed_out());
}

#[test]
fn stop_before_timeout_suppresses_fire() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let mut dog = Watchdog::start(Duration::from_secs(60), move || {
        flag.store(true, Ordering::SeqCst);
    });
    dog.stop();
    assert!(!fired.load(Ordering::SeqCst));
    assert!(!dog.timed_out());
}

#[test]
fn stop_is_idempotent() {
    let mut dog = Watchdog::start(Duration::from_secs(60), || {});
    dog.stop();
    dog.stop();
    assert!(!dog.timed_out());
}
