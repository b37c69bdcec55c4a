// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon crate.

use std::path::PathBuf;

use crate::lifecycle::LifecycleError;

/// Daemon version, written next to the PID lock at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolve state directory: GANGER_STATE_DIR > XDG_STATE_HOME/ganger >
/// ~/.local/state/ganger
pub fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Ok(dir) = std::env::var("GANGER_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg).join("ganger"));
    }
    let home = dirs::home_dir().ok_or(LifecycleError::NoStateDir)?;
    Ok(home.join(".local/state/ganger"))
}

/// Config file override.
pub fn config_path() -> Option<PathBuf> {
    std::env::var("GANGER_CONFIG").ok().map(PathBuf::from)
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
