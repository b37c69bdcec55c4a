// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test doubles for the executor's collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gg_core::{BuildResult, RepoState, WorkItem};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::merger::{Merger, MergerError, RepoUpdate};
use crate::queue::{QueueError, QueueJob, QueueRegistration};

// ---- merger ----

/// Scriptable in-memory merger. Checkouts copy a seeded template tree
/// into the destination, so builds see real files.
pub struct FakeMerger {
    update_result: Mutex<Result<RepoUpdate, MergerError>>,
    merge_result: Mutex<Result<Option<String>, MergerError>>,
    line_map: Mutex<HashMap<(String, u32), Option<u32>>>,
    seeds: Mutex<HashMap<String, PathBuf>>,

    pub updates: Mutex<Vec<(String, String)>>,
    pub checkouts: Mutex<Vec<(String, String, String)>>,
    pub state_sets: Mutex<usize>,
    pub resets: AtomicUsize,
}

impl Default for FakeMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMerger {
    pub fn new() -> Self {
        Self {
            update_result: Mutex::new(Ok(RepoUpdate {
                canonical_name: None,
                branches: vec!["master".to_string()],
                refs: Default::default(),
            })),
            merge_result: Mutex::new(Ok(Some("deadbeef".to_string()))),
            line_map: Mutex::new(HashMap::new()),
            seeds: Mutex::new(HashMap::new()),
            updates: Mutex::new(Vec::new()),
            checkouts: Mutex::new(Vec::new()),
            state_sets: Mutex::new(0),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn set_update_result(&self, result: Result<RepoUpdate, MergerError>) {
        *self.update_result.lock() = result;
    }

    pub fn set_merge_result(&self, result: Result<Option<String>, MergerError>) {
        *self.merge_result.lock() = result;
    }

    pub fn map_line_to(&self, filename: &str, line: u32, mapped: Option<u32>) {
        self.line_map.lock().insert((filename.to_string(), line), mapped);
    }

    /// Template tree copied into every checkout of `project`.
    pub fn seed(&self, project: &str, template: &Path) {
        self.seeds.lock().insert(project.to_string(), template.to_path_buf());
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().len()
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

impl Merger for FakeMerger {
    fn update(
        &self,
        connection: &str,
        project: &str,
        _repo_state: &RepoState,
    ) -> Result<RepoUpdate, MergerError> {
        self.updates
            .lock()
            .push((connection.to_string(), project.to_string()));
        self.update_result.lock().clone()
    }

    fn merge_changes(
        &self,
        _items: &[WorkItem],
        _repo_state: &RepoState,
    ) -> Result<Option<String>, MergerError> {
        self.merge_result.lock().clone()
    }

    fn set_repo_state(
        &self,
        _items: &[WorkItem],
        _repo_state: &RepoState,
    ) -> Result<(), MergerError> {
        *self.state_sets.lock() += 1;
        Ok(())
    }

    fn checkout(
        &self,
        connection: &str,
        project: &str,
        ref_name: &str,
        dest: &Path,
    ) -> Result<(), MergerError> {
        self.checkouts.lock().push((
            connection.to_string(),
            project.to_string(),
            ref_name.to_string(),
        ));
        let seed = self.seeds.lock().get(project).cloned();
        match seed {
            Some(template) => copy_tree(&template, dest)
                .map_err(|e| MergerError::Other(e.to_string())),
            None => std::fs::create_dir_all(dest).map_err(|e| MergerError::Other(e.to_string())),
        }
    }

    fn map_line(
        &self,
        _commit: &str,
        filename: &str,
        line: u32,
    ) -> Result<Option<u32>, MergerError> {
        Ok(self
            .line_map
            .lock()
            .get(&(filename.to_string(), line))
            .copied()
            .unwrap_or(Some(line)))
    }

    fn reset(&self) -> Result<(), MergerError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---- queue ----

/// Records everything the build reports and lets a test block until the
/// terminal result arrives.
pub struct RecordingQueueJob {
    unique: String,
    arguments: Value,
    pub data: Mutex<Vec<Value>>,
    pub exceptions: Mutex<Vec<String>>,
    result: Mutex<Option<BuildResult>>,
    done: Condvar,
}

impl RecordingQueueJob {
    pub fn new(unique: &str, arguments: Value) -> Self {
        Self {
            unique: unique.to_string(),
            arguments,
            data: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// The terminal result, waiting up to `timeout` for it to arrive.
    pub fn wait_result(&self, timeout: Duration) -> Option<BuildResult> {
        let mut result = self.result.lock();
        if result.is_none() {
            self.done.wait_for(&mut result, timeout);
        }
        result.clone()
    }

    pub fn result(&self) -> Option<BuildResult> {
        self.result.lock().clone()
    }
}

impl QueueJob for RecordingQueueJob {
    fn unique(&self) -> &str {
        &self.unique
    }

    fn arguments(&self) -> &Value {
        &self.arguments
    }

    fn send_work_data(&self, data: &Value) -> Result<(), QueueError> {
        self.data.lock().push(data.clone());
        Ok(())
    }

    fn send_work_complete(&self, result: &BuildResult) -> Result<(), QueueError> {
        *self.result.lock() = Some(result.clone());
        self.done.notify_all();
        Ok(())
    }

    fn send_work_exception(&self, message: &str) -> Result<(), QueueError> {
        self.exceptions.lock().push(message.to_string());
        self.done.notify_all();
        Ok(())
    }
}

/// Registration toggles in arrival order; `true` is a register.
#[derive(Default)]
pub struct RecordingRegistration {
    pub events: Mutex<Vec<bool>>,
}

impl QueueRegistration for RecordingRegistration {
    fn register(&self) -> Result<(), QueueError> {
        self.events.lock().push(true);
        Ok(())
    }

    fn unregister(&self) -> Result<(), QueueError> {
        self.events.lock().push(false);
        Ok(())
    }
}

// ---- interpreter stubs ----

/// Write an executable shell script, for standing in as the playbook or
/// ad-hoc interpreter.
pub fn write_script(path: &Path, body: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\n{body}\n"))?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}
