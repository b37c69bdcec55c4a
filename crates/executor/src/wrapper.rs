// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interface to the sandbox-launch collaborator.
//!
//! A wrapper turns "these paths read-only, these read-write, these secret
//! payloads" into a way of launching interpreter processes under those
//! constraints. The executor only ever launches through a context it got
//! from a wrapper.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Factory for execution contexts. One context is created per build.
pub trait ExecutionWrapper: Send + Sync {
    fn execution_context(
        &self,
        ro_paths: Vec<PathBuf>,
        rw_paths: Vec<PathBuf>,
        secrets: HashMap<PathBuf, String>,
    ) -> io::Result<Box<dyn ExecutionContext>>;
}

/// Launches interpreter processes under one build's path constraints.
pub trait ExecutionContext: Send + Sync {
    /// Build a launchable command for `argv`, rooted at `work_dir` with
    /// `env` merged over the inherited environment.
    fn command(
        &self,
        argv: &[String],
        work_dir: &Path,
        env: &HashMap<String, String>,
    ) -> io::Result<Command>;
}

/// Pass-through wrapper: no confinement, secrets written straight to
/// their destination paths with owner-only permissions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWrapper;

impl ExecutionWrapper for NullWrapper {
    fn execution_context(
        &self,
        _ro_paths: Vec<PathBuf>,
        _rw_paths: Vec<PathBuf>,
        secrets: HashMap<PathBuf, String>,
    ) -> io::Result<Box<dyn ExecutionContext>> {
        for (path, content) in &secrets {
            write_secret(path, content)?;
        }
        Ok(Box::new(NullContext))
    }
}

#[cfg(unix)]
fn write_secret(path: &Path, content: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

struct NullContext;

impl ExecutionContext for NullContext {
    fn command(
        &self,
        argv: &[String],
        work_dir: &Path,
        env: &HashMap<String, String>,
    ) -> io::Result<Command> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::other("empty command"));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(work_dir).envs(env);
        Ok(cmd)
    }
}
