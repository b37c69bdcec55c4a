// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Phase and build outcome types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution phase of a playbook within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Pre,
    Run,
    Post,
    Cleanup,
}

crate::simple_display! {
    Phase {
        Setup => "setup",
        Pre => "pre",
        Run => "run",
        Post => "post",
        Cleanup => "cleanup",
    }
}

/// Result of one supervised interpreter invocation.
///
/// `Normal` carries the raw exit code; the caller decides success or
/// failure from it. The other variants override any exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Normal(i32),
    TimedOut,
    Unreachable,
    Aborted,
}

impl RunOutcome {
    /// Uppercase label used in log banners.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Normal(_) => "NORMAL",
            RunOutcome::TimedOut => "TIMED_OUT",
            RunOutcome::Unreachable => "UNREACHABLE",
            RunOutcome::Aborted => "ABORTED",
        }
    }

    /// Clean exit: ran to completion with exit code zero.
    pub fn succeeded(&self) -> bool {
        matches!(self, RunOutcome::Normal(0))
    }
}

/// Why a build was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Operator or queue-side stop request.
    Operator,
    /// Disk accountant evicted the build for exceeding its quota.
    DiskFull,
    /// The executor is shutting down.
    Shutdown,
}

/// Coarse terminal classification of a build.
///
/// A build that should be rescheduled elsewhere reports no outcome at all
/// (`Option<BuildOutcome>::None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildOutcome {
    Success,
    Failure,
    PostFailure,
    TimedOut,
    Aborted,
    DiskFull,
    MergerFailure,
    /// Consistently-fatal executor error; carries a detail message in the
    /// surrounding [`BuildResult`].
    Error,
}

crate::simple_display! {
    BuildOutcome {
        Success => "SUCCESS",
        Failure => "FAILURE",
        PostFailure => "POST_FAILURE",
        TimedOut => "TIMED_OUT",
        Aborted => "ABORTED",
        DiskFull => "DISK_FULL",
        MergerFailure => "MERGER_FAILURE",
        Error => "ERROR",
    }
}

/// Terminal output of one build, handed to the queue collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    /// `None` asks the queue to reschedule the build.
    pub result: Option<BuildOutcome>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Structured payload the automation run wrote to the result file.
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl BuildResult {
    pub fn new(outcome: BuildOutcome) -> Self {
        Self { result: Some(outcome), warnings: Vec::new(), data: Value::Null, error_detail: None }
    }

    /// No concrete outcome: the queue should retry the build elsewhere.
    pub fn retry() -> Self {
        Self { result: None, warnings: Vec::new(), data: Value::Null, error_detail: None }
    }

    pub fn aborted() -> Self {
        Self::new(BuildOutcome::Aborted)
    }

    /// Consistently-fatal executor error; never rescheduled.
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            result: Some(BuildOutcome::Error),
            warnings: Vec::new(),
            data: Value::Null,
            error_detail: Some(detail.into()),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

#[cfg(test)]
#[path = "outcome_tests.rs"]
mod tests;
