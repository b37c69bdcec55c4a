// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! gg-core: data model for the Ganger build-job executor.
//!
//! Pure types only: job descriptions as they arrive from the work queue,
//! connection variants, phase and outcome enums, and the declarative
//! macros shared by the other crates. No I/O, no threads.

pub mod macros;

pub mod job;
pub mod outcome;
pub mod vars;

pub use job::{
    BuildId, Connection, HostSpec, JobDescription, JobGroup, JobParseError, PlaybookSpec,
    ProjectSpec, RepoState, RoleSpec, SshKey, Trust, WorkItem,
};
#[cfg(any(test, feature = "test-support"))]
pub use job::{HostSpecBuilder, JobDescriptionBuilder};
pub use outcome::{AbortReason, BuildOutcome, BuildResult, Phase, RunOutcome};
pub use vars::{check_varnames, PROTECTED_HOST_VARS, RESERVED_VAR_NAMES};
