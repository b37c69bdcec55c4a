// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness for the integration specs.

pub use std::sync::Arc;
pub use std::time::Duration;

pub use gg_core::BuildOutcome;
pub use serde_json::{json, Value};

use std::path::PathBuf;

use gg_executor::queue::QueueJob;
use gg_executor::runner::RunnerConfig;
use gg_executor::test_support::{
    write_script, FakeMerger, RecordingQueueJob, RecordingRegistration,
};
use gg_executor::wrapper::NullWrapper;
use gg_executor::{ExecutorConfig, ExecutorServer};

pub const SPEC_WAIT: Duration = Duration::from_secs(30);

pub const PROJECT: &str = "acme/widgets";
pub const CONNECTION: &str = "gerrit";

/// One executor with stub interpreters and a seeded project template.
/// `script` is the body of the playbook interpreter; the probe
/// interpreter always succeeds.
pub struct Harness {
    pub merger: Arc<FakeMerger>,
    pub registration: Arc<RecordingRegistration>,
    pub server: Arc<ExecutorServer>,
    jobs_root: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn start(script: &str) -> Self {
        Self::start_with(script, |_| {})
    }

    pub fn start_with(script: &str, configure: impl FnOnce(&mut ExecutorConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        write_script(&bin.join("playbook"), script).unwrap();
        write_script(&bin.join("adhoc"), "exit 0").unwrap();

        let template = dir.path().join("template");
        std::fs::create_dir_all(template.join("playbooks")).unwrap();
        for name in ["pre.yaml", "run.yaml", "post.yaml", "cleanup.yaml"] {
            std::fs::write(template.join("playbooks").join(name), "---\n").unwrap();
        }
        let merger = Arc::new(FakeMerger::new());
        merger.seed(PROJECT, &template);

        let jobs_root = dir.path().join("builds");
        let mut config = ExecutorConfig {
            jobs_root: jobs_root.clone(),
            hostname: "spec-node".to_string(),
            // Generous thresholds so the governor never deregisters.
            load_multiplier: 10_000.0,
            min_avail_mem: 0.0,
            min_avail_hdd: 0.0,
            disk_limit_per_job_mb: -1,
            runner: RunnerConfig {
                playbook_program: bin.join("playbook").display().to_string(),
                adhoc_program: bin.join("adhoc").display().to_string(),
                plugin_root: None,
            },
            ..ExecutorConfig::default()
        };
        configure(&mut config);

        let registration = Arc::new(RecordingRegistration::default());
        let server = ExecutorServer::new(
            config,
            Arc::clone(&merger) as Arc<dyn gg_executor::merger::Merger>,
            Arc::new(NullWrapper),
            Arc::clone(&registration) as Arc<dyn gg_executor::queue::QueueRegistration>,
        );
        server.start().unwrap();
        Self { merger, registration, server, jobs_root, _dir: dir }
    }

    pub fn submit(&self, job: Value) -> Arc<RecordingQueueJob> {
        let build = job["build"].as_str().unwrap().to_string();
        let queue_job = Arc::new(RecordingQueueJob::new(&build, job));
        self.server
            .execute_job(Arc::clone(&queue_job) as Arc<dyn QueueJob>);
        queue_job
    }

    /// Scratch directory of one build.
    pub fn jobdir(&self, build: &str) -> PathBuf {
        self.jobs_root.join(build)
    }

    pub fn work_file(&self, build: &str, name: &str) -> PathBuf {
        self.jobdir(build).join("work").join(name)
    }

    pub fn shutdown(self) {
        self.server.stop();
        self.server.join();
    }
}

/// A playbook entry on the seeded project.
pub fn playbook(path: &str) -> Value {
    json!({
        "connection": CONNECTION,
        "project": PROJECT,
        "branch": "master",
        "path": path,
        "trust": "untrusted",
    })
}

/// Poll `cond` until it holds or `max` elapses.
pub fn wait_for(max: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + max;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    cond()
}
