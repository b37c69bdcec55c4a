// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue socket protocol.
//!
//! Wire format: one JSON document per line. A connection submits
//! [`QueueRequest`]s; the daemon answers each with one or more
//! [`QueueEvent`] lines. An `execute` request holds its connection open
//! until the terminal `complete` or `exception` event.

use gg_core::BuildResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueueRequest {
    /// Submit a build. `job` is a serialized job description; its `build`
    /// field keys later `stop`/`resume` requests.
    Execute { job: Value },

    /// Abort a running build. The queue will not retry it.
    Stop { build: String },

    /// Release a paused build.
    Resume { build: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// The build was accepted and is starting.
    Accepted { build: String },

    /// Acknowledgment for `stop`/`resume`; `found` is false when no such
    /// build is running.
    Ack { build: String, found: bool },

    /// Intermediate build data, e.g. the console stream address.
    Data { data: Value },

    /// Terminal result. Exactly one per accepted build.
    Complete { result: BuildResult },

    /// Orchestration failure that prevented a result.
    Exception { message: String },

    /// Protocol-level error for a malformed request.
    Error { message: String },
}

impl QueueEvent {
    /// Whether this event ends an `execute` exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueEvent::Complete { .. } | QueueEvent::Exception { .. })
    }
}

/// Encode one message as a wire line, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
