// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interface to the work-distribution queue collaborator.
//!
//! The executor receives builds from the queue, streams progress data
//! back, and reports exactly one terminal result per build. Registration
//! controls whether this node advertises capacity at all; the governor
//! flips it as sensors trip and recover.

use gg_core::BuildResult;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("queue transport failed: {0}")]
pub struct QueueError(pub String);

/// One accepted build as the queue sees it.
pub trait QueueJob: Send + Sync {
    /// Queue-wide unique id; equals the build id.
    fn unique(&self) -> &str;

    /// The serialized job description this build was submitted with.
    fn arguments(&self) -> &Value;

    /// Stream intermediate key/value data, e.g. the log-stream address.
    fn send_work_data(&self, data: &Value) -> Result<(), QueueError>;

    /// Report the terminal result. Called exactly once per build.
    fn send_work_complete(&self, result: &BuildResult) -> Result<(), QueueError>;

    /// Report an orchestration-level failure that prevented a result.
    fn send_work_exception(&self, message: &str) -> Result<(), QueueError>;
}

/// Capacity advertisement toward the queue.
pub trait QueueRegistration: Send + Sync {
    fn register(&self) -> Result<(), QueueError>;
    fn unregister(&self) -> Result<(), QueueError>;
}
