// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gg_core::{BuildOutcome, RepoState, WorkItem};
use serde_json::json;

use super::{ExecutorConfig, ExecutorServer};
use crate::merger::{Merger, MergerError, RepoUpdate};
use crate::runner::RunnerConfig;
use crate::test_support::{
    write_script, FakeMerger, RecordingQueueJob, RecordingRegistration,
};
use crate::wrapper::NullWrapper;

fn test_config(jobs_root: &Path) -> ExecutorConfig {
    ExecutorConfig {
        jobs_root: jobs_root.to_path_buf(),
        hostname: "test-node".to_string(),
        // Generous thresholds so only the pause sensor can trip here.
        load_multiplier: 10_000.0,
        min_avail_mem: 0.0,
        min_avail_hdd: 0.0,
        disk_limit_per_job_mb: -1,
        ..ExecutorConfig::default()
    }
}

fn server_with(
    config: ExecutorConfig,
    merger: Arc<FakeMerger>,
    registration: Arc<RecordingRegistration>,
) -> Arc<ExecutorServer> {
    ExecutorServer::new(config, merger, Arc::new(NullWrapper), registration)
}

#[test]
fn unparseable_job_reports_exception() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with(
        test_config(dir.path()),
        Arc::new(FakeMerger::new()),
        Arc::new(RecordingRegistration::default()),
    );

    let queue_job = Arc::new(RecordingQueueJob::new("b-bad", json!({"not": "a job"})));
    server.execute_job(Arc::clone(&queue_job) as Arc<dyn crate::queue::QueueJob>);

    assert_eq!(queue_job.exceptions.lock().len(), 1);
    assert_eq!(server.build_count(), 0);
}

#[test]
fn pause_and_unpause_flip_registration() {
    let dir = tempfile::tempdir().unwrap();
    let registration = Arc::new(RecordingRegistration::default());
    let server = server_with(
        test_config(dir.path()),
        Arc::new(FakeMerger::new()),
        Arc::clone(&registration),
    );

    server.unpause_accepting();
    server.pause_accepting();
    server.unpause_accepting();

    assert_eq!(*registration.events.lock(), vec![true, false, true]);
}

#[test]
fn stop_unregisters_once() {
    let dir = tempfile::tempdir().unwrap();
    let registration = Arc::new(RecordingRegistration::default());
    let server = server_with(
        test_config(dir.path()),
        Arc::new(FakeMerger::new()),
        Arc::clone(&registration),
    );

    server.unpause_accepting();
    server.stop();
    server.stop();

    assert_eq!(*registration.events.lock(), vec![true, false]);
}

#[test]
fn start_sweeps_stale_build_directories() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("b-old");
    std::fs::create_dir_all(stale.join("work")).unwrap();

    let server = server_with(
        test_config(dir.path()),
        Arc::new(FakeMerger::new()),
        Arc::new(RecordingRegistration::default()),
    );
    server.start().unwrap();

    assert!(!stale.exists());
    server.stop();
    server.join();
}

#[test]
fn start_keeps_stale_directories_when_retention_is_on() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("b-old");
    std::fs::create_dir_all(&stale).unwrap();

    let config = ExecutorConfig { keep_jobdir: true, ..test_config(dir.path()) };
    let server = server_with(
        config,
        Arc::new(FakeMerger::new()),
        Arc::new(RecordingRegistration::default()),
    );
    server.start().unwrap();

    assert!(stale.exists());
    server.stop();
    server.join();
}

#[test]
fn tracking_a_thread_reaps_finished_ones() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with(
        test_config(dir.path()),
        Arc::new(FakeMerger::new()),
        Arc::new(RecordingRegistration::default()),
    );

    let finished = std::thread::spawn(|| {});
    while !finished.is_finished() {
        std::thread::sleep(Duration::from_millis(5));
    }
    server.track_thread(finished);
    assert_eq!(server.threads.lock().len(), 1);

    let live = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(200)));
    server.track_thread(live);
    // The dead handle was joined on the way in; only the live one stays.
    assert_eq!(server.threads.lock().len(), 1);
    server.join();
}

#[test]
fn unknown_command_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with(
        test_config(dir.path()),
        Arc::new(FakeMerger::new()),
        Arc::new(RecordingRegistration::default()),
    );
    server.command("frobnicate");
}

#[test]
fn build_runs_to_success_through_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("playbook"), "exit 0").unwrap();
    write_script(&bin.join("adhoc"), "exit 0").unwrap();

    let template = dir.path().join("template");
    std::fs::create_dir_all(template.join("playbooks")).unwrap();
    std::fs::write(template.join("playbooks/run.yaml"), "---\n").unwrap();

    let merger = Arc::new(FakeMerger::new());
    merger.seed("acme/widgets", &template);

    let jobs_root = dir.path().join("builds");
    let config = ExecutorConfig {
        runner: RunnerConfig {
            playbook_program: bin.join("playbook").display().to_string(),
            adhoc_program: bin.join("adhoc").display().to_string(),
            plugin_root: None,
        },
        ..test_config(&jobs_root)
    };
    let server = server_with(
        config,
        Arc::clone(&merger),
        Arc::new(RecordingRegistration::default()),
    );
    server.start().unwrap();

    let arguments = json!({
        "build": "b-1",
        "job_name": "unit",
        "playbooks": [{
            "connection": "gerrit",
            "project": "acme/widgets",
            "branch": "master",
            "path": "playbooks/run.yaml",
            "trust": "untrusted",
        }],
    });
    let queue_job = Arc::new(RecordingQueueJob::new("b-1", arguments));
    server.execute_job(Arc::clone(&queue_job) as Arc<dyn crate::queue::QueueJob>);

    let result = queue_job.wait_result(Duration::from_secs(30)).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));
    assert!(merger.update_count() >= 1);

    server.stop();
    server.join();
    assert_eq!(server.build_count(), 0);
}

/// Delegates to a [`FakeMerger`] but dwells inside `update` long enough
/// for a second worker to collide, recording the peak overlap.
struct SlowUpdateMerger {
    inner: FakeMerger,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowUpdateMerger {
    fn new() -> Self {
        Self {
            inner: FakeMerger::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl Merger for SlowUpdateMerger {
    fn update(
        &self,
        connection: &str,
        project: &str,
        repo_state: &RepoState,
    ) -> Result<RepoUpdate, MergerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.update(connection, project, repo_state)
    }

    fn merge_changes(
        &self,
        items: &[WorkItem],
        repo_state: &RepoState,
    ) -> Result<Option<String>, MergerError> {
        self.inner.merge_changes(items, repo_state)
    }

    fn set_repo_state(
        &self,
        items: &[WorkItem],
        repo_state: &RepoState,
    ) -> Result<(), MergerError> {
        self.inner.set_repo_state(items, repo_state)
    }

    fn checkout(
        &self,
        connection: &str,
        project: &str,
        ref_name: &str,
        dest: &Path,
    ) -> Result<(), MergerError> {
        self.inner.checkout(connection, project, ref_name, dest)
    }

    fn map_line(&self, commit: &str, filename: &str, line: u32) -> Result<Option<u32>, MergerError> {
        self.inner.map_line(commit, filename, line)
    }

    fn reset(&self) -> Result<(), MergerError> {
        self.inner.reset()
    }
}

#[test]
fn same_repository_is_never_updated_by_two_workers_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("playbook"), "exit 0").unwrap();
    write_script(&bin.join("adhoc"), "exit 0").unwrap();

    let template = dir.path().join("template");
    std::fs::create_dir_all(template.join("playbooks")).unwrap();
    std::fs::write(template.join("playbooks/run.yaml"), "---\n").unwrap();

    let merger = Arc::new(SlowUpdateMerger::new());
    merger.inner.seed("acme/widgets", &template);

    let jobs_root = dir.path().join("builds");
    let config = ExecutorConfig {
        runner: RunnerConfig {
            playbook_program: bin.join("playbook").display().to_string(),
            adhoc_program: bin.join("adhoc").display().to_string(),
            plugin_root: None,
        },
        ..test_config(&jobs_root)
    };
    let server = ExecutorServer::new(
        config,
        Arc::clone(&merger) as Arc<dyn Merger>,
        Arc::new(NullWrapper),
        Arc::new(RecordingRegistration::default()),
    );
    server.start().unwrap();

    // Distinct repo states keep the two tasks from coalescing in the
    // update queue, so both land on worker threads.
    let job = |build: &str, sha: &str| {
        json!({
            "build": build,
            "job_name": "unit",
            "repo_state": {"gerrit": {"acme/widgets": {"refs/heads/master": sha}}},
            "playbooks": [{
                "connection": "gerrit",
                "project": "acme/widgets",
                "branch": "master",
                "path": "playbooks/run.yaml",
                "trust": "untrusted",
            }],
        })
    };
    let first = Arc::new(RecordingQueueJob::new("b-r1", job("b-r1", "aaa")));
    let second = Arc::new(RecordingQueueJob::new("b-r2", job("b-r2", "bbb")));
    server.execute_job(Arc::clone(&first) as Arc<dyn crate::queue::QueueJob>);
    server.execute_job(Arc::clone(&second) as Arc<dyn crate::queue::QueueJob>);

    assert!(first.wait_result(Duration::from_secs(30)).is_some());
    assert!(second.wait_result(Duration::from_secs(30)).is_some());
    assert_eq!(merger.max_in_flight.load(Ordering::SeqCst), 1);

    server.stop();
    server.join();
}

#[test]
fn failed_console_forward_does_not_fail_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("playbook"), "exit 0").unwrap();
    write_script(&bin.join("adhoc"), "exit 0").unwrap();

    let template = dir.path().join("template");
    std::fs::create_dir_all(template.join("playbooks")).unwrap();
    std::fs::write(template.join("playbooks/run.yaml"), "---\n").unwrap();

    let merger = Arc::new(FakeMerger::new());
    merger.seed("acme/widgets", &template);

    let jobs_root = dir.path().join("builds");
    let config = ExecutorConfig {
        runner: RunnerConfig {
            playbook_program: bin.join("playbook").display().to_string(),
            adhoc_program: bin.join("adhoc").display().to_string(),
            plugin_root: None,
        },
        ..test_config(&jobs_root)
    };
    let server = server_with(
        config,
        Arc::clone(&merger),
        Arc::new(RecordingRegistration::default()),
    );
    server.start().unwrap();

    // The tunnel to this pod cannot come up; the build must carry on
    // without console streaming rather than error out.
    let arguments = json!({
        "build": "b-fwd",
        "job_name": "unit",
        "nodes": [{
            "name": "pod1",
            "connection": {
                "kind": "kubectl",
                "context": "nowhere",
                "namespace": "default",
                "pod": "pod1",
                "config": "apiVersion: v1\nclusters: []\n",
            },
        }],
        "playbooks": [{
            "connection": "gerrit",
            "project": "acme/widgets",
            "branch": "master",
            "path": "playbooks/run.yaml",
            "trust": "untrusted",
        }],
    });
    let queue_job = Arc::new(RecordingQueueJob::new("b-fwd", arguments));
    server.execute_job(Arc::clone(&queue_job) as Arc<dyn crate::queue::QueueJob>);

    let result = queue_job.wait_result(Duration::from_secs(30)).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));

    server.stop();
    server.join();
}

#[test]
fn secret_bearing_playbook_never_displays_task_args() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("playbook"), "exit 0").unwrap();
    write_script(&bin.join("adhoc"), "exit 0").unwrap();

    let template = dir.path().join("template");
    std::fs::create_dir_all(template.join("playbooks")).unwrap();
    std::fs::write(template.join("playbooks/run.yaml"), "---\n").unwrap();

    let merger = Arc::new(FakeMerger::new());
    merger.seed("acme/widgets", &template);

    let jobs_root = dir.path().join("builds");
    let config = ExecutorConfig {
        keep_jobdir: true,
        runner: RunnerConfig {
            playbook_program: bin.join("playbook").display().to_string(),
            adhoc_program: bin.join("adhoc").display().to_string(),
            plugin_root: None,
        },
        ..test_config(&jobs_root)
    };
    let server = server_with(
        config,
        Arc::clone(&merger),
        Arc::new(RecordingRegistration::default()),
    );
    server.start().unwrap();

    let arguments = json!({
        "build": "b-secret",
        "job_name": "unit",
        "playbooks": [{
            "connection": "gerrit",
            "project": "acme/widgets",
            "branch": "master",
            "path": "playbooks/run.yaml",
            "trust": "trusted",
            "secrets": {"token": "hunter2"},
        }],
    });
    let queue_job = Arc::new(RecordingQueueJob::new("b-secret", arguments));
    server.execute_job(Arc::clone(&queue_job) as Arc<dyn crate::queue::QueueJob>);

    let result = queue_job.wait_result(Duration::from_secs(30)).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));

    let cfg = std::fs::read_to_string(
        jobs_root.join("b-secret/ansible/playbook_0/ansible.cfg"),
    )
    .unwrap();
    assert!(cfg.contains("display_args_to_stdout = False"));

    server.stop();
    server.join();
}
