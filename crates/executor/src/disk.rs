// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-build disk usage accounting.
//!
//! A background thread walks every immediate child of the jobs root on a
//! self-adjusting interval and reports directories that exceed the
//! per-build quota, so the orchestrator can evict the offending build.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Shared {
    stop: Mutex<bool>,
    cond: Condvar,
}

/// Background poller enforcing a per-build on-disk quota.
///
/// A negative limit disables the accountant entirely: `start` spawns no
/// thread and `stop` is a no-op.
pub struct DiskAccountant {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DiskAccountant {
    /// Start polling. `on_over_limit` is invoked with the offending
    /// directory and its measured size in MB, possibly repeatedly on
    /// successive scans until the directory shrinks or disappears.
    pub fn start<F>(jobs_root: PathBuf, limit_mb: i64, on_over_limit: F) -> Self
    where
        F: Fn(&Path, u64) + Send + 'static,
    {
        let shared = Arc::new(Shared { stop: Mutex::new(false), cond: Condvar::new() });
        if limit_mb < 0 {
            return Self { shared, handle: None };
        }
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("disk-accountant".to_string())
            .spawn(move || run(thread_shared, jobs_root, limit_mb as u64, on_over_limit));
        let handle = match handle {
            Ok(h) => Some(h),
            Err(error) => {
                tracing::error!(%error, "failed to spawn disk accountant thread");
                None
            }
        };
        Self { shared, handle }
    }

    /// Whether the accountant is actually polling.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop polling and join the background thread.
    pub fn stop(&mut self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiskAccountant {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F: Fn(&Path, u64)>(shared: Arc<Shared>, jobs_root: PathBuf, limit_mb: u64, func: F) {
    loop {
        let started = Instant::now();
        scan(&jobs_root, limit_mb, &func);
        // Sleep half as long as the scan took, but at least a second, so a
        // slow disk is not hammered by its own accounting.
        let delay = (started.elapsed() / 2).max(Duration::from_secs(1));
        let mut stop = shared.stop.lock();
        if *stop {
            return;
        }
        shared.cond.wait_for(&mut stop, delay);
        if *stop {
            return;
        }
    }
}

fn scan<F: Fn(&Path, u64)>(jobs_root: &Path, limit_mb: u64, func: &F) {
    let entries = match std::fs::read_dir(jobs_root) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!(%error, root = %jobs_root.display(), "disk accountant scan failed");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let size_mb = directory_size(&path) / (1024 * 1024);
        if size_mb > limit_mb {
            tracing::info!(
                build_dir = %path.display(),
                size_mb,
                limit_mb,
                "build directory is over quota"
            );
            func(&path, size_mb);
        }
    }
}

/// Recursive apparent size of a directory in bytes. Symlinks are counted
/// by their own size, never followed.
pub fn directory_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
#[path = "disk_tests.rs"]
mod tests;
