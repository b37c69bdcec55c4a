// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types raised during build preparation and execution.

use crate::merger::MergerError;

/// Error raised while preparing or running a build.
///
/// Most variants are consistently fatal: retrying the build elsewhere
/// would fail the same way, so they map to an `ERROR` outcome with the
/// message as detail rather than a reschedule.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("unable to find role {role} for playbook in {project}")]
    RoleNotFound { role: String, project: String },

    #[error("untrusted checkout of {project} contains a plugin directory: {path}")]
    PluginDirFound { project: String, path: String },

    #[error("playbook {path} not found in {project}@{branch}")]
    PlaybookNotFound { path: String, project: String, branch: String },

    #[error("job has no run playbook")]
    NoPlaybook,

    #[error("unable to resolve a branch to check out for {project}")]
    UnresolvedBranch { project: String },

    #[error("repository update failed for {project} on {connection}")]
    UpdateFailed { connection: String, project: String },

    #[error("merger error: {0}")]
    Merger(#[from] MergerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
