// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! gg-executor: the build-job execution engine.
//!
//! Accepts parsed job descriptions, prepares an isolated job directory per
//! build (checkouts, roles, inventories, secrets), supervises interpreter
//! processes through their phases, and reports a terminal result. A
//! governor keeps the host out of overload by pausing intake when load,
//! memory, or disk sensors trip.
//!
//! Collaborators the executor does not own (the work queue, the repository
//! merger, the execution sandbox) are traits in [`queue`], [`merger`], and
//! [`wrapper`].

pub mod disk;
pub mod error;
pub mod inventory;
pub mod job;
pub mod jobdir;
pub mod merger;
pub mod port_forward;
pub mod queue;
pub mod runner;
pub mod sensors;
pub mod server;
pub mod ssh_agent;
pub mod update_queue;
pub mod watchdog;
pub mod wrapper;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::ExecutorError;
pub use job::{BuildJob, JobContext};
pub use server::{ExecutorConfig, ExecutorServer};
