// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Executor orchestration.
//!
//! The [`ExecutorServer`] owns the shared services every build uses: the
//! deduplicating repository update queue and its worker pool, the load
//! governor that flips queue registration as sensors trip, and the disk
//! accountant that aborts builds overrunning their scratch budget. Each
//! accepted build runs on its own thread as a [`BuildJob`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use gg_core::{AbortReason, JobDescription};
use parking_lot::{Condvar, Mutex};

use crate::disk::DiskAccountant;
use crate::inventory::InventoryConfig;
use crate::job::{BuildJob, JobContext};
use crate::merger::{Merger, MergerError};
use crate::queue::{QueueJob, QueueRegistration};
use crate::runner::RunnerConfig;
use crate::sensors::{
    CpuSensor, HddSensor, PauseSensor, RamSensor, Sensor, StartingBuildsSensor,
};
use crate::update_queue::DeduplicateQueue;
use crate::wrapper::ExecutionWrapper;

/// Drain polling period during a graceful shutdown.
const GRACEFUL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub jobs_root: PathBuf,
    pub hostname: String,
    /// Load-average ceiling as a multiple of the CPU count.
    pub load_multiplier: f64,
    /// Minimum available memory, percent of total.
    pub min_avail_mem: f64,
    /// Minimum free space on the jobs filesystem, percent of total.
    pub min_avail_hdd: f64,
    /// Per-build scratch budget in MB; negative disables accounting.
    pub disk_limit_per_job_mb: i64,
    /// Ceiling on builds that have not run their first playbook yet.
    pub max_starting_builds: usize,
    pub keep_jobdir: bool,
    pub verbose: bool,
    pub log_stream_port: u16,
    /// Connectivity probe budget.
    pub setup_timeout: Duration,
    /// Governor polling period.
    pub governor_interval: Duration,
    /// Site-wide variables merged under every job's own variables.
    pub site_vars: serde_json::Map<String, serde_json::Value>,
    /// Extra read-only paths granted to every build's sandbox.
    pub ro_paths: Vec<PathBuf>,
    /// Extra read-write paths granted to every build's sandbox.
    pub rw_paths: Vec<PathBuf>,
    pub runner: RunnerConfig,
    pub inventory: InventoryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            jobs_root: PathBuf::from("/var/lib/ganger/builds"),
            hostname: hostname(),
            load_multiplier: 2.5,
            min_avail_mem: 5.0,
            min_avail_hdd: 5.0,
            disk_limit_per_job_mb: 250,
            max_starting_builds: 10,
            keep_jobdir: false,
            verbose: false,
            log_stream_port: 7900,
            setup_timeout: Duration::from_secs(60),
            governor_interval: Duration::from_secs(10),
            site_vars: serde_json::Map::new(),
            ro_paths: Vec::new(),
            rw_paths: Vec::new(),
            runner: RunnerConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

struct RunningBuild {
    job: Arc<BuildJob>,
}

struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self { stopped: Mutex::new(false), cond: Condvar::new() }
    }

    fn trip(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Sleep until the interval elapses or the signal trips. Returns
    /// whether the signal has tripped.
    fn wait(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_for(&mut stopped, interval);
        }
        *stopped
    }
}

pub struct ExecutorServer {
    config: ExecutorConfig,
    merger: Arc<dyn Merger>,
    wrapper: Arc<dyn ExecutionWrapper>,
    registration: Arc<dyn QueueRegistration>,

    updates: Arc<DeduplicateQueue>,
    // One lock per (connection, project): workers may drain distinct
    // queued states for the same repository, but never touch it in two
    // threads at once.
    repo_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    builds: Mutex<HashMap<String, RunningBuild>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    accountant: Mutex<Option<DiskAccountant>>,

    sensors: Vec<Box<dyn Sensor>>,
    starting_builds: Arc<AtomicUsize>,
    manual_pause: Arc<AtomicBool>,
    registered: AtomicBool,
    accepting: AtomicBool,
    keep_jobdir: AtomicBool,
    verbose: AtomicBool,
    stop_signal: StopSignal,
}

impl ExecutorServer {
    pub fn new(
        config: ExecutorConfig,
        merger: Arc<dyn Merger>,
        wrapper: Arc<dyn ExecutionWrapper>,
        registration: Arc<dyn QueueRegistration>,
    ) -> Arc<Self> {
        let starting_builds = Arc::new(AtomicUsize::new(0));
        let manual_pause = Arc::new(AtomicBool::new(false));
        let sensors: Vec<Box<dyn Sensor>> = vec![
            Box::new(CpuSensor::new(config.load_multiplier)),
            Box::new(RamSensor::new(config.min_avail_mem)),
            Box::new(HddSensor::new(config.jobs_root.clone(), config.min_avail_hdd)),
            Box::new(StartingBuildsSensor::new(
                Arc::clone(&starting_builds),
                config.max_starting_builds,
            )),
            Box::new(PauseSensor::new(Arc::clone(&manual_pause))),
        ];
        Arc::new(Self {
            keep_jobdir: AtomicBool::new(config.keep_jobdir),
            verbose: AtomicBool::new(config.verbose),
            config,
            merger,
            wrapper,
            registration,
            updates: Arc::new(DeduplicateQueue::new()),
            repo_locks: Mutex::new(HashMap::new()),
            builds: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            accountant: Mutex::new(None),
            sensors,
            starting_builds,
            manual_pause,
            registered: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            stop_signal: StopSignal::new(),
        })
    }

    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config.jobs_root)?;
        self.sweep_stale_jobdirs();

        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        for index in 0..workers {
            let server = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("repo-update-{index}"))
                .spawn(move || server.run_update_worker())?;
            self.track_thread(handle);
        }

        let server = Arc::clone(self);
        let governor = std::thread::Builder::new()
            .name("governor".to_string())
            .spawn(move || server.run_governor())?;
        self.track_thread(governor);

        let weak = Arc::downgrade(self);
        let accountant = DiskAccountant::start(
            self.config.jobs_root.clone(),
            self.config.disk_limit_per_job_mb,
            move |path, size_mb| {
                let Some(server) = weak.upgrade() else {
                    return;
                };
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    server.stop_build_disk_full(name, size_mb);
                }
            },
        );
        *self.accountant.lock() = Some(accountant);

        self.manage_load();
        tracing::info!(
            jobs_root = %self.config.jobs_root.display(),
            workers,
            "executor started"
        );
        Ok(())
    }

    /// Leftovers from a previous process are unowned and unreported;
    /// nothing will ever finish them.
    fn sweep_stale_jobdirs(&self) {
        if self.keep_jobdir.load(Ordering::SeqCst) {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.config.jobs_root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            tracing::info!(path = %path.display(), "removing stale build directory");
            if let Err(error) = std::fs::remove_dir_all(&path) {
                tracing::warn!(path = %path.display(), %error,
                    "failed to remove stale build directory");
            }
        }
    }

    // ---- build lifecycle ----

    /// Accept one build from the queue and run it on its own thread.
    pub fn execute_job(self: &Arc<Self>, queue_job: Arc<dyn QueueJob>) {
        let unique = queue_job.unique().to_string();
        let description = match JobDescription::parse(queue_job.arguments()) {
            Ok(description) => description,
            Err(error) => {
                tracing::warn!(%unique, %error, "rejecting unparseable job");
                let _ = queue_job.send_work_exception(&error.to_string());
                return;
            }
        };

        let context = JobContext {
            jobs_root: self.config.jobs_root.clone(),
            keep_jobdir: self.keep_jobdir.load(Ordering::SeqCst),
            verbose: self.verbose.load(Ordering::SeqCst),
            hostname: self.config.hostname.clone(),
            log_stream_port: self.config.log_stream_port,
            setup_timeout: self.config.setup_timeout,
            site_vars: self.config.site_vars.clone(),
            ro_paths: self.config.ro_paths.clone(),
            rw_paths: self.config.rw_paths.clone(),
            runner: self.config.runner.clone(),
            inventory: self.config.inventory.clone(),
        };
        let job = Arc::new(BuildJob::new(
            description,
            queue_job,
            Arc::clone(&self.merger),
            Arc::clone(&self.wrapper),
            Arc::clone(&self.updates),
            context,
        ));

        self.builds
            .lock()
            .insert(unique.clone(), RunningBuild { job: Arc::clone(&job) });

        let server = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("build-{unique}"))
            .spawn(move || {
                job.run();
                server.finish_job(&unique);
            });
        match spawned {
            Ok(handle) => self.track_thread(handle),
            Err(error) => {
                tracing::error!(%error, "failed to spawn build thread");
            }
        }
    }

    fn finish_job(&self, unique: &str) {
        self.builds.lock().remove(unique);
    }

    /// Abort one build; the queue will not retry it.
    pub fn stop_build(&self, unique: &str) -> bool {
        let Some(job) = self.find_build(unique) else {
            return false;
        };
        job.abort(AbortReason::Operator);
        true
    }

    /// Release one paused build.
    pub fn resume_build(&self, unique: &str) -> bool {
        let Some(job) = self.find_build(unique) else {
            return false;
        };
        job.resume();
        true
    }

    fn stop_build_disk_full(&self, unique: &str, size_mb: u64) {
        let Some(job) = self.find_build(unique) else {
            return;
        };
        tracing::warn!(%unique, size_mb, "build exceeded disk budget, aborting");
        job.abort(AbortReason::DiskFull);
    }

    fn find_build(&self, unique: &str) -> Option<Arc<BuildJob>> {
        self.builds.lock().get(unique).map(|b| Arc::clone(&b.job))
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().len()
    }

    // ---- operator commands ----

    /// Dispatch a one-word operator command from the command socket.
    pub fn command(self: &Arc<Self>, name: &str) {
        match name {
            "stop" => self.stop(),
            "graceful" => self.graceful(),
            "pause" => self.pause_accepting(),
            "unpause" => self.unpause_accepting(),
            "keep" => self.set_keep_jobdir(true),
            "nokeep" => self.set_keep_jobdir(false),
            "verbose" => self.set_verbose(true),
            "unverbose" => self.set_verbose(false),
            other => tracing::warn!(command = other, "unknown command"),
        }
    }

    pub fn pause_accepting(&self) {
        tracing::info!("pausing queue registration");
        self.manual_pause.store(true, Ordering::SeqCst);
        self.manage_load();
    }

    pub fn unpause_accepting(&self) {
        tracing::info!("resuming queue registration");
        self.manual_pause.store(false, Ordering::SeqCst);
        self.manage_load();
    }

    pub fn set_keep_jobdir(&self, keep: bool) {
        tracing::info!(keep, "setting build directory retention");
        self.keep_jobdir.store(keep, Ordering::SeqCst);
    }

    pub fn set_verbose(&self, verbose: bool) {
        tracing::info!(verbose, "setting interpreter verbosity");
        self.verbose.store(verbose, Ordering::SeqCst);
    }

    // ---- shutdown ----

    /// Stop accepting work and wait for running builds to finish, then
    /// stop. Returns once the drain thread is started.
    pub fn graceful(self: &Arc<Self>) {
        tracing::info!("beginning graceful shutdown");
        self.accepting.store(false, Ordering::SeqCst);
        self.unregister();
        let server = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("graceful".to_string())
            .spawn(move || {
                while server.build_count() > 0 {
                    if server.stop_signal.wait(GRACEFUL_INTERVAL) {
                        return;
                    }
                }
                server.stop();
            });
        match spawned {
            Ok(handle) => self.track_thread(handle),
            Err(error) => {
                tracing::error!(%error, "failed to spawn drain thread");
                self.stop();
            }
        }
    }

    /// Stop accepting work, abort every running build, and release the
    /// worker pool. Running build threads observe the abort and finish on
    /// their own; call [`join`](Self::join) to wait for them.
    pub fn stop(&self) {
        tracing::info!("stopping executor");
        self.accepting.store(false, Ordering::SeqCst);
        self.unregister();
        self.stop_signal.trip();

        if let Some(mut accountant) = self.accountant.lock().take() {
            accountant.stop();
        }

        let jobs: Vec<Arc<BuildJob>> = self
            .builds
            .lock()
            .values()
            .map(|b| Arc::clone(&b.job))
            .collect();
        for job in jobs {
            job.abort(AbortReason::Shutdown);
        }

        // Fails pending update tasks and releases blocked workers.
        self.updates.close();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_signal.stopped.lock()
    }

    /// Block until [`stop`](Self::stop) has been called, from any thread.
    pub fn wait_stopped(&self) {
        let mut stopped = self.stop_signal.stopped.lock();
        while !*stopped {
            self.stop_signal.cond.wait(&mut stopped);
        }
    }

    /// Record a spawned thread for [`join`](Self::join), reaping any that
    /// have already finished so the list does not grow for the life of
    /// the server.
    fn track_thread(&self, new: JoinHandle<()>) {
        let mut threads = self.threads.lock();
        for handle in std::mem::take(&mut *threads) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                threads.push(handle);
            }
        }
        threads.push(new);
    }

    /// Wait for every worker, governor, and build thread.
    pub fn join(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut threads = self.threads.lock();
                std::mem::take(&mut *threads)
            };
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                let _ = handle.join();
            }
        }
    }

    // ---- repository update workers ----

    fn repo_lock(&self, connection: &str, project: &str) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock();
        Arc::clone(
            locks
                .entry((connection.to_string(), project.to_string()))
                .or_default(),
        )
    }

    fn run_update_worker(&self) {
        while let Some(task) = self.updates.get() {
            tracing::debug!(
                connection = %task.connection,
                project = %task.project,
                "updating repository"
            );
            let lock = self.repo_lock(&task.connection, &task.project);
            let _held = lock.lock();
            match self
                .merger
                .update(&task.connection, &task.project, &task.repo_state)
            {
                Ok(update) => task.complete(true, Some(update)),
                Err(MergerError::PoolBroken) => {
                    tracing::error!("merger pool broken during update, resetting");
                    if let Err(error) = self.merger.reset() {
                        tracing::error!(%error, "merger pool reset failed");
                    }
                    task.complete(false, None);
                }
                Err(error) => {
                    tracing::warn!(
                        connection = %task.connection,
                        project = %task.project,
                        %error,
                        "repository update failed"
                    );
                    task.complete(false, None);
                }
            }
        }
    }

    // ---- load governor ----

    fn run_governor(&self) {
        loop {
            if self.stop_signal.wait(self.config.governor_interval) {
                return;
            }
            self.manage_load();
        }
    }

    /// Poll every sensor and flip queue registration accordingly. Also
    /// refreshes the starting-builds gauge the sensor reads.
    fn manage_load(&self) {
        let starting = self
            .builds
            .lock()
            .values()
            .filter(|b| b.job.is_running() && !b.job.is_started())
            .count();
        self.starting_builds.store(starting, Ordering::SeqCst);

        if !self.accepting.load(Ordering::SeqCst) {
            self.unregister();
            return;
        }
        let mut ok = true;
        for sensor in &self.sensors {
            let (sensor_ok, reason) = sensor.is_ok();
            if !sensor_ok {
                tracing::info!(sensor = sensor.name(), reason, "sensor tripped");
                ok = false;
            }
        }
        if ok {
            self.register();
        } else {
            self.unregister();
        }
    }

    fn register(&self) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("registering for work");
        if let Err(error) = self.registration.register() {
            tracing::error!(%error, "queue registration failed");
            self.registered.store(false, Ordering::SeqCst);
        }
    }

    fn unregister(&self) {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("unregistering from work");
        if let Err(error) = self.registration.unregister() {
            tracing::error!(%error, "queue unregistration failed");
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
