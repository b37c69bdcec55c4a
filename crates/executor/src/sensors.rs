// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission sensors polled by the governor.
//!
//! Each sensor answers "should this node keep accepting work" with a
//! reason string suitable for the governor's log line. Readings are
//! polled, never persisted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A pluggable health check.
pub trait Sensor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `(ok, reason)`; the reason is logged on every governor decision.
    fn is_ok(&self) -> (bool, String);
}

/// Load-average sensor: not-ok above `multiplier * cpu_count`.
pub struct CpuSensor {
    max_load: f64,
}

impl CpuSensor {
    pub fn new(load_multiplier: f64) -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self { max_load: load_multiplier * cpus as f64 }
    }

    fn load_average() -> Option<f64> {
        let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
        raw.split_whitespace().next()?.parse().ok()
    }
}

impl Sensor for CpuSensor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn is_ok(&self) -> (bool, String) {
        // Platforms without /proc never trip this sensor.
        let Some(load) = Self::load_average() else {
            return (true, "load average unavailable".to_string());
        };
        let reason = format!("load average {load:.2}, limit {:.2}", self.max_load);
        (load <= self.max_load, reason)
    }
}

/// Free-memory sensor: not-ok when available RAM drops below the given
/// percentage of total.
pub struct RamSensor {
    min_avail_percent: f64,
}

impl RamSensor {
    pub fn new(min_avail_percent: f64) -> Self {
        Self { min_avail_percent }
    }

    fn meminfo() -> Option<(u64, u64)> {
        let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total = None;
        let mut avail = None;
        for line in raw.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total = parts.next()?.parse().ok(),
                Some("MemAvailable:") => avail = parts.next()?.parse().ok(),
                _ => {}
            }
        }
        Some((total?, avail?))
    }
}

impl Sensor for RamSensor {
    fn name(&self) -> &'static str {
        "ram"
    }

    fn is_ok(&self) -> (bool, String) {
        let Some((total_kb, avail_kb)) = Self::meminfo() else {
            return (true, "meminfo unavailable".to_string());
        };
        if total_kb == 0 {
            return (true, "meminfo unavailable".to_string());
        }
        let avail_percent = 100.0 * avail_kb as f64 / total_kb as f64;
        let reason = format!(
            "{avail_percent:.1}% RAM available, minimum {:.1}%",
            self.min_avail_percent
        );
        (avail_percent >= self.min_avail_percent, reason)
    }
}

/// Free-disk sensor for the jobs root filesystem.
pub struct HddSensor {
    jobs_root: PathBuf,
    min_avail_percent: f64,
}

impl HddSensor {
    pub fn new(jobs_root: PathBuf, min_avail_percent: f64) -> Self {
        Self { jobs_root, min_avail_percent }
    }
}

impl Sensor for HddSensor {
    fn name(&self) -> &'static str {
        "hdd"
    }

    fn is_ok(&self) -> (bool, String) {
        let (avail, total) = match (
            fs2::available_space(&self.jobs_root),
            fs2::total_space(&self.jobs_root),
        ) {
            (Ok(a), Ok(t)) if t > 0 => (a, t),
            _ => return (true, "disk statistics unavailable".to_string()),
        };
        let avail_percent = 100.0 * avail as f64 / total as f64;
        let reason = format!(
            "{avail_percent:.1}% disk available on {}, minimum {:.1}%",
            self.jobs_root.display(),
            self.min_avail_percent
        );
        (avail_percent >= self.min_avail_percent, reason)
    }
}

/// Backpressure on builds that have been accepted but have not started
/// their first playbook yet.
pub struct StartingBuildsSensor {
    starting: Arc<AtomicUsize>,
    max_starting: usize,
}

impl StartingBuildsSensor {
    pub fn new(starting: Arc<AtomicUsize>, max_starting: usize) -> Self {
        Self { starting, max_starting }
    }
}

impl Sensor for StartingBuildsSensor {
    fn name(&self) -> &'static str {
        "starting-builds"
    }

    fn is_ok(&self) -> (bool, String) {
        let count = self.starting.load(Ordering::SeqCst);
        let reason = format!("{count} builds starting, limit {}", self.max_starting);
        (count < self.max_starting, reason)
    }
}

/// Operator pause flag.
pub struct PauseSensor {
    paused: Arc<AtomicBool>,
}

impl PauseSensor {
    pub fn new(paused: Arc<AtomicBool>) -> Self {
        Self { paused }
    }
}

impl Sensor for PauseSensor {
    fn name(&self) -> &'static str {
        "pause"
    }

    fn is_ok(&self) -> (bool, String) {
        if self.paused.load(Ordering::SeqCst) {
            (false, "node is paused by operator".to_string())
        } else {
            (true, "node is not paused".to_string())
        }
    }
}

#[cfg(test)]
#[path = "sensors_tests.rs"]
mod tests;
