// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Deduplicated repository-update scheduling.
//!
//! Concurrent builds that need the same (connection, project) at the same
//! repo state collapse to one physical fetch. Every logical requester
//! blocks on the shared task's completion event and observes the same
//! success value.

use std::collections::VecDeque;
use std::sync::Arc;

use gg_core::RepoState;
use parking_lot::{Condvar, Mutex};

use crate::merger::RepoUpdate;

struct TaskState {
    complete: bool,
    success: bool,
    update: Option<RepoUpdate>,
}

/// A request to bring one (connection, project) pair to a given repo state.
///
/// The completion event is set exactly once; a second completion attempt is
/// ignored. Waiters are always released, a failed update included.
pub struct UpdateTask {
    pub connection: String,
    pub project: String,
    pub repo_state: RepoState,
    state: Mutex<TaskState>,
    cond: Condvar,
}

impl UpdateTask {
    pub fn new(
        connection: impl Into<String>,
        project: impl Into<String>,
        repo_state: RepoState,
    ) -> Self {
        Self {
            connection: connection.into(),
            project: project.into(),
            repo_state,
            state: Mutex::new(TaskState { complete: false, success: false, update: None }),
            cond: Condvar::new(),
        }
    }

    /// Tasks are interchangeable when they would perform the same fetch.
    pub fn matches(&self, other: &UpdateTask) -> bool {
        self.connection == other.connection
            && self.project == other.project
            && self.repo_state == other.repo_state
    }

    /// Release all waiters with the fetch result. Only the first call takes
    /// effect.
    pub fn complete(&self, success: bool, update: Option<RepoUpdate>) {
        let mut state = self.state.lock();
        if state.complete {
            return;
        }
        state.complete = true;
        state.success = success;
        state.update = update;
        drop(state);
        self.cond.notify_all();
    }

    /// Block until the task completes; returns the success flag and the
    /// fetch summary, if any.
    pub fn wait(&self) -> (bool, Option<RepoUpdate>) {
        let mut state = self.state.lock();
        while !state.complete {
            self.cond.wait(&mut state);
        }
        (state.success, state.update.clone())
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }
}

impl std::fmt::Debug for UpdateTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateTask")
            .field("connection", &self.connection)
            .field("project", &self.project)
            .finish()
    }
}

struct QueueState {
    items: VecDeque<Arc<UpdateTask>>,
    closed: bool,
}

/// FIFO queue that coalesces equal pending tasks.
pub struct DeduplicateQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl Default for DeduplicateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeduplicateQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState { items: VecDeque::new(), closed: false }),
            cond: Condvar::new(),
        }
    }

    /// Enqueue a task, or return the already-pending equal task so the
    /// caller waits on that one instead.
    pub fn put(&self, task: UpdateTask) -> Arc<UpdateTask> {
        let mut state = self.state.lock();
        if let Some(pending) = state.items.iter().find(|t| t.matches(&task)) {
            return Arc::clone(pending);
        }
        let task = Arc::new(task);
        if state.closed {
            // Shut down: fail immediately rather than strand the waiter.
            drop(state);
            task.complete(false, None);
            return task;
        }
        state.items.push_back(Arc::clone(&task));
        drop(state);
        self.cond.notify_one();
        task
    }

    /// Block for the next task. Returns `None` once the queue is closed and
    /// drained, which tells a worker thread to exit.
    pub fn get(&self) -> Option<Arc<UpdateTask>> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.items.pop_front() {
                return Some(task);
            }
            if state.closed {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Close the queue: wake every worker and fail any tasks still pending
    /// so their waiters are released.
    pub fn close(&self) {
        let drained: Vec<Arc<UpdateTask>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        self.cond.notify_all();
        for task in drained {
            task.complete(false, None);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

#[cfg(test)]
#[path = "update_queue_tests.rs"]
mod tests;
