// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interface to the repository merge/checkout collaborator.
//!
//! The executor never touches version control itself. It asks a [`Merger`]
//! to fetch repositories, apply speculative merges, and materialize
//! checkouts into job directories.

use std::collections::BTreeMap;
use std::path::Path;

use gg_core::{RepoState, WorkItem};

/// Summary of one repository fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoUpdate {
    /// Canonical project name as the remote reports it, when known.
    pub canonical_name: Option<String>,
    /// Branch heads present after the fetch.
    pub branches: Vec<String>,
    /// Ref name to sha for every ref the fetch touched.
    pub refs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MergerError {
    /// The merger's worker pool died mid-task. The orchestrator resets the
    /// pool and the affected build is retried, not failed.
    #[error("merger worker pool is broken")]
    PoolBroken,

    /// The merger refused the request as malformed. The build is aborted
    /// and retried.
    #[error("merger rejected request: {0}")]
    Rejected(String),

    #[error("merger failed: {0}")]
    Other(String),
}

/// Repository fetch, speculative merge, and checkout operations.
pub trait Merger: Send + Sync {
    /// Bring the local mirror of a project up to the given repo state.
    fn update(
        &self,
        connection: &str,
        project: &str,
        repo_state: &RepoState,
    ) -> Result<RepoUpdate, MergerError>;

    /// Speculatively merge proposed changes on top of the pinned state.
    /// Returns the merged commit id, or `None` on a merge conflict.
    fn merge_changes(
        &self,
        items: &[WorkItem],
        repo_state: &RepoState,
    ) -> Result<Option<String>, MergerError>;

    /// Restore an explicit prior repository state for ref items.
    fn set_repo_state(&self, items: &[WorkItem], repo_state: &RepoState)
        -> Result<(), MergerError>;

    /// Materialize a checkout of `project` at `ref_name` into `dest`.
    fn checkout(
        &self,
        connection: &str,
        project: &str,
        ref_name: &str,
        dest: &Path,
    ) -> Result<(), MergerError>;

    /// Map a line number in a file to its position in the given commit,
    /// for out-of-line review comments. `None` when the line has no
    /// counterpart.
    fn map_line(
        &self,
        commit: &str,
        filename: &str,
        line: u32,
    ) -> Result<Option<u32>, MergerError>;

    /// Replace a broken worker pool. Called by the orchestrator after a
    /// [`MergerError::PoolBroken`].
    fn reset(&self) -> Result<(), MergerError>;
}
