// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gg_core::RepoState;

use super::*;

fn task(connection: &str, project: &str) -> UpdateTask {
    UpdateTask::new(connection, project, RepoState::default())
}

#[test]
fn put_returns_existing_equal_task() {
    let queue = DeduplicateQueue::new();
    let first = queue.put(task("c1", "p1"));
    let second = queue.put(task("c1", "p1"));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(queue.len(), 1);
}

#[test]
fn distinct_tasks_all_enqueue() {
    let queue = DeduplicateQueue::new();
    queue.put(task("c1", "p1"));
    queue.put(task("c1", "p2"));
    queue.put(task("c2", "p1"));
    assert_eq!(queue.len(), 3);
}

#[test]
fn differing_repo_state_is_not_a_duplicate() {
    let queue = DeduplicateQueue::new();
    let first = queue.put(task("c1", "p1"));
    let state: RepoState = serde_json::from_value(serde_json::json!({
        "c1": {"p1": {"refs/heads/master": "deadbeef"}},
    }))
    .unwrap();
    let second = queue.put(UpdateTask::new("c1", "p1", state));
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(queue.len(), 2);
}

#[test]
fn get_is_fifo() {
    let queue = DeduplicateQueue::new();
    queue.put(task("c1", "p1"));
    queue.put(task("c1", "p2"));
    assert_eq!(queue.get().unwrap().project, "p1");
    assert_eq!(queue.get().unwrap().project, "p2");
}

#[test]
fn all_waiters_observe_single_completion() {
    let queue = Arc::new(DeduplicateQueue::new());
    let a = queue.put(task("c1", "p1"));
    let b = queue.put(task("c1", "p1"));

    let waiter = {
        let b = Arc::clone(&b);
        thread::spawn(move || b.wait())
    };

    let worker = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let t = queue.get().unwrap();
            t.complete(true, Some(RepoUpdate::default()));
        })
    };

    let (success, update) = a.wait();
    assert!(success);
    assert!(update.is_some());
    let (success, _) = waiter.join().unwrap();
    assert!(success);
    worker.join().unwrap();
    // The coalesced pair left exactly one physical task behind.
    assert!(queue.is_empty());
}

#[test]
fn completion_is_set_once() {
    let t = task("c1", "p1");
    t.complete(false, None);
    t.complete(true, Some(RepoUpdate::default()));
    let (success, update) = t.wait();
    assert!(!success);
    assert!(update.is_none());
}

#[test]
fn close_fails_pending_tasks() {
    let queue = DeduplicateQueue::new();
    let pending = queue.put(task("c1", "p1"));
    queue.close();
    let (success, _) = pending.wait();
    assert!(!success);
    assert!(queue.get().is_none());
}

#[test]
fn close_releases_blocked_worker() {
    let queue = Arc::new(DeduplicateQueue::new());
    let worker = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.get())
    };
    thread::sleep(Duration::from_millis(20));
    queue.close();
    assert!(worker.join().unwrap().is_none());
}

#[test]
fn put_after_close_fails_fast() {
    let queue = DeduplicateQueue::new();
    queue.close();
    let t = queue.put(task("c1", "p1"));
    let (success, _) = t.wait();
    assert!(!success);
}
