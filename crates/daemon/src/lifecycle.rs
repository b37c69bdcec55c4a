// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon startup and shutdown plumbing: state-dir layout, the PID file
//! lock that keeps a second daemon off the same state dir, and socket
//! hygiene.

use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::config::{ConfigError, DaemonConfig};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("unable to resolve a state directory; set GANGER_STATE_DIR or HOME")]
    NoStateDir,

    #[error("another daemon holds the lock: {0}")]
    LockFailed(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Resolved filesystem layout for one daemon instance.
#[derive(Debug, Clone)]
pub struct Paths {
    pub state_dir: PathBuf,
    pub command_socket: PathBuf,
    pub queue_socket: PathBuf,
    pub lock_path: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    pub fn resolve(config: &DaemonConfig) -> Result<Self, LifecycleError> {
        let state_dir = config.state_dir()?;
        Ok(Self {
            command_socket: config.command_socket(&state_dir),
            queue_socket: config.queue_socket(&state_dir),
            lock_path: state_dir.join("ggd.pid"),
            log_dir: state_dir.join("logs"),
            state_dir,
        })
    }

    pub fn create_dirs(&self) -> Result<(), LifecycleError> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        if let Some(parent) = self.command_socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.queue_socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Exclusive daemon lock; holds the flock for the life of the process.
pub struct PidLock {
    _file: std::fs::File,
    path: PathBuf,
}

/// Acquire the PID lock. Open without truncating so a losing race does
/// not wipe the running daemon's PID, then write ours once the lock is
/// held.
pub fn acquire_pid_lock(path: &Path) -> Result<PidLock, LifecycleError> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.try_lock_exclusive().map_err(LifecycleError::LockFailed)?;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(PidLock { _file: file, path: path.to_path_buf() })
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Remove a socket file left by an unclean shutdown. The PID lock
/// guarantees no live daemon owns it.
pub fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
