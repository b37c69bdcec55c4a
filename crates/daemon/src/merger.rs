// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Merger adapter over an external helper program.
//!
//! The version-control engine lives outside this process. Each operation
//! invokes the configured helper with a single JSON request on stdin and
//! reads a single JSON response from stdout. The helper reports pool
//! breakage and rejections through the response `kind` so they map onto
//! the retry semantics the executor expects.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use gg_executor::merger::{Merger, MergerError, RepoUpdate};
use gg_core::{RepoState, WorkItem};
use serde_json::{json, Value};

pub struct CommandMerger {
    program: PathBuf,
}

impl CommandMerger {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    fn call(&self, request: Value) -> Result<Value, MergerError> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MergerError::Other(format!("failed to launch merge helper: {e}")))?;

        if let Some(stdin) = child.stdin.as_mut() {
            let line = request.to_string();
            stdin
                .write_all(line.as_bytes())
                .and_then(|()| stdin.write_all(b"\n"))
                .map_err(|e| MergerError::Other(format!("merge helper stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| MergerError::Other(format!("merge helper wait: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MergerError::Other(format!(
                "merge helper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let response: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| MergerError::Other(format!("merge helper response: {e}")))?;
        if response.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(response);
        }
        let message = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unspecified merge helper failure")
            .to_string();
        match response.get("kind").and_then(Value::as_str) {
            Some("pool_broken") => Err(MergerError::PoolBroken),
            Some("rejected") => Err(MergerError::Rejected(message)),
            _ => Err(MergerError::Other(message)),
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, MergerError> {
    serde_json::to_value(value).map_err(|e| MergerError::Other(e.to_string()))
}

impl Merger for CommandMerger {
    fn update(
        &self,
        connection: &str,
        project: &str,
        repo_state: &RepoState,
    ) -> Result<RepoUpdate, MergerError> {
        let response = self.call(json!({
            "op": "update",
            "connection": connection,
            "project": project,
            "repo_state": to_value(repo_state)?,
        }))?;
        let branches = response
            .get("branches")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let refs = response
            .get("refs")
            .and_then(Value::as_object)
            .map(|o| {
                o.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(RepoUpdate {
            canonical_name: response
                .get("canonical_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            branches,
            refs,
        })
    }

    fn merge_changes(
        &self,
        items: &[WorkItem],
        repo_state: &RepoState,
    ) -> Result<Option<String>, MergerError> {
        let response = self.call(json!({
            "op": "merge",
            "items": to_value(&items)?,
            "repo_state": to_value(repo_state)?,
        }))?;
        Ok(response
            .get("commit")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn set_repo_state(
        &self,
        items: &[WorkItem],
        repo_state: &RepoState,
    ) -> Result<(), MergerError> {
        self.call(json!({
            "op": "set_repo_state",
            "items": to_value(&items)?,
            "repo_state": to_value(repo_state)?,
        }))?;
        Ok(())
    }

    fn checkout(
        &self,
        connection: &str,
        project: &str,
        ref_name: &str,
        dest: &Path,
    ) -> Result<(), MergerError> {
        self.call(json!({
            "op": "checkout",
            "connection": connection,
            "project": project,
            "ref": ref_name,
            "dest": dest,
        }))?;
        Ok(())
    }

    fn map_line(
        &self,
        commit: &str,
        filename: &str,
        line: u32,
    ) -> Result<Option<u32>, MergerError> {
        let response = self.call(json!({
            "op": "map_line",
            "commit": commit,
            "filename": filename,
            "line": line,
        }))?;
        Ok(response
            .get("line")
            .and_then(Value::as_u64)
            .map(|n| n as u32))
    }

    fn reset(&self) -> Result<(), MergerError> {
        self.call(json!({"op": "reset"}))?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "merger_tests.rs"]
mod tests;
