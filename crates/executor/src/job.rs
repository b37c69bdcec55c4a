// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-build state machine.
//!
//! A [`BuildJob`] consumes one parsed job description on a dedicated
//! thread: repositories are fetched through the shared update queue, the
//! job directory is prepared, then playbooks run phase by phase under
//! watchdog supervision. Abort is idempotent, wins over every other
//! outcome, and releases a paused build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gg_core::{
    AbortReason, BuildId, BuildOutcome, BuildResult, JobDescription, Phase, PlaybookSpec,
    RunOutcome, Trust, WorkItem,
};
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Map, Value};

use crate::error::ExecutorError;
use crate::inventory::{self, InventoryConfig};
use crate::jobdir::{JobDir, JobDirPlaybook};
use crate::merger::{Merger, MergerError, RepoUpdate};
use crate::port_forward::PortForward;
use crate::queue::QueueJob;
use crate::runner::{
    build_playbook_command, build_setup_command, run_command, write_ansible_config,
    write_vars_blacklist, ConsoleLog, CpuTimes, PhaseVars, ProcSlot, RunnerConfig,
};
use crate::ssh_agent::SshAgent;
use crate::update_queue::{DeduplicateQueue, UpdateTask};
use crate::wrapper::{ExecutionContext, ExecutionWrapper};

/// Per-playbook budget for the cleanup phase.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(300);
/// Remote console-stream port forwarded for pod targets.
const LOG_STREAM_PORT: u16 = 19885;

/// Server-level settings handed to every build.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub jobs_root: PathBuf,
    pub keep_jobdir: bool,
    pub verbose: bool,
    pub hostname: String,
    pub log_stream_port: u16,
    /// Connectivity probe budget. A host that cannot answer fact
    /// gathering in this window is treated as a network problem, not a
    /// job failure.
    pub setup_timeout: Duration,
    /// Site-wide variables merged under the job's own variables.
    pub site_vars: Map<String, Value>,
    /// Extra read-only paths granted to the sandbox.
    pub ro_paths: Vec<PathBuf>,
    /// Extra read-write paths granted to the sandbox.
    pub rw_paths: Vec<PathBuf>,
    pub runner: RunnerConfig,
    pub inventory: InventoryConfig,
}

struct Control {
    aborted: bool,
    aborted_reason: Option<AbortReason>,
    paused: bool,
}

/// One build in flight. Shared between its job thread and whichever
/// threads deliver abort/resume requests.
pub struct BuildJob {
    build: BuildId,
    description: JobDescription,
    queue_job: Arc<dyn QueueJob>,
    merger: Arc<dyn Merger>,
    wrapper: Arc<dyn ExecutionWrapper>,
    updates: Arc<DeduplicateQueue>,
    context: JobContext,

    control: Mutex<Control>,
    resume_cond: Condvar,
    proc_slot: ProcSlot,
    cpu: CpuTimes,
    running: AtomicBool,
    started: AtomicBool,
    cleanup_started: AtomicBool,
}

type ProjectInfo = HashMap<(String, String), RepoUpdate>;

struct Prepared {
    pre: Vec<JobDirPlaybook>,
    run: Vec<JobDirPlaybook>,
    post: Vec<JobDirPlaybook>,
    cleanup: Vec<JobDirPlaybook>,
}

impl BuildJob {
    pub fn new(
        description: JobDescription,
        queue_job: Arc<dyn QueueJob>,
        merger: Arc<dyn Merger>,
        wrapper: Arc<dyn ExecutionWrapper>,
        updates: Arc<DeduplicateQueue>,
        context: JobContext,
    ) -> Self {
        Self {
            build: description.build_id.clone(),
            description,
            queue_job,
            merger,
            wrapper,
            updates,
            context,
            control: Mutex::new(Control {
                aborted: false,
                aborted_reason: None,
                paused: false,
            }),
            resume_cond: Condvar::new(),
            proc_slot: ProcSlot::new(),
            cpu: CpuTimes::default(),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
        }
    }

    pub fn build(&self) -> &BuildId {
        &self.build
    }

    /// Whether the build has begun its first playbook. Builds that have
    /// not started yet count against the starting-builds sensor.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cpu_seconds(&self) -> f64 {
        self.cpu.total_seconds()
    }

    /// Request termination. Idempotent; wins over any other outcome. Wakes
    /// a paused build and kills the live interpreter process group, except
    /// once cleanup playbooks have begun.
    pub fn abort(&self, reason: AbortReason) {
        {
            let mut control = self.control.lock();
            if control.aborted {
                return;
            }
            control.aborted = true;
            control.aborted_reason = Some(reason);
        }
        tracing::info!(build = %self.build, ?reason, "aborting build");
        self.resume_cond.notify_all();
        if !self.cleanup_started.load(Ordering::SeqCst) {
            self.proc_slot.kill_group();
        }
    }

    /// Release a paused build.
    pub fn resume(&self) {
        let mut control = self.control.lock();
        control.paused = false;
        drop(control);
        self.resume_cond.notify_all();
    }

    fn aborted(&self) -> bool {
        self.control.lock().aborted
    }

    fn aborted_reason(&self) -> Option<AbortReason> {
        self.control.lock().aborted_reason
    }

    /// Run the build to completion and report exactly one terminal result.
    /// Every resource acquired here is released on every exit path.
    pub fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let started_at = Instant::now();
        let _ = self.queue_job.send_work_data(&self.base_work_data());

        let mut agent = None;
        let mut forwards: Vec<PortForward> = Vec::new();
        let mut jobdir = None;

        let outcome = self.acquire_and_execute(&mut jobdir, &mut agent, &mut forwards);
        match outcome {
            Ok(result) => {
                tracing::info!(build = %self.build, result = ?result.result, "build complete");
                if let Err(error) = self.queue_job.send_work_complete(&result) {
                    tracing::error!(build = %self.build, %error, "failed to report result");
                }
            }
            Err(ExecutorError::Merger(MergerError::PoolBroken)) => {
                tracing::error!(build = %self.build, "merger pool broken, retrying build");
                if let Err(error) = self.merger.reset() {
                    tracing::error!(%error, "merger pool reset failed");
                }
                let _ = self.queue_job.send_work_complete(&BuildResult::aborted());
            }
            Err(error @ (ExecutorError::Io(_) | ExecutorError::Json(_))) => {
                tracing::error!(build = %self.build, %error, "error while executing build");
                let _ = self.queue_job.send_work_exception(&error.to_string());
            }
            Err(error) => {
                tracing::warn!(build = %self.build, %error, "build failed fatally");
                let _ = self
                    .queue_job
                    .send_work_complete(&BuildResult::error(error.to_string()));
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(mut dir) = jobdir {
            dir.cleanup();
        }
        if let Some(mut agent) = agent {
            agent.stop();
        }
        for mut fwd in forwards {
            fwd.stop();
        }
        tracing::info!(
            build = %self.build,
            elapsed_secs = started_at.elapsed().as_secs_f64(),
            cpu_secs = self.cpu.total_seconds(),
            "build thread finished"
        );
    }

    fn base_work_data(&self) -> Value {
        json!({
            "worker_name": self.context.hostname,
            "worker_hostname": self.context.hostname,
            "worker_log_port": self.context.log_stream_port,
        })
    }

    fn acquire_and_execute(
        &self,
        jobdir: &mut Option<JobDir>,
        agent: &mut Option<SshAgent>,
        forwards: &mut Vec<PortForward>,
    ) -> Result<BuildResult, ExecutorError> {
        if !self.description.ssh_keys.is_empty() {
            let ssh = SshAgent::start()?;
            for key in &self.description.ssh_keys {
                ssh.add_key_data(&key.name, &key.key)?;
            }
            *agent = Some(ssh);
        }
        let dir = JobDir::new(&self.context.jobs_root, self.context.keep_jobdir, &self.build)?;
        let dir = jobdir.insert(dir);
        self.execute(dir, agent.as_ref(), forwards)
    }

    fn execute(
        &self,
        jobdir: &mut JobDir,
        agent: Option<&SshAgent>,
        forwards: &mut Vec<PortForward>,
    ) -> Result<BuildResult, ExecutorError> {
        tracing::info!(
            build = %self.build,
            job = %self.description.job_name,
            root = %jobdir.root.display(),
            "beginning build"
        );

        let project_info = self.update_repositories()?;
        if self.aborted() {
            return Ok(BuildResult::aborted());
        }

        // Speculative merge for change items; an explicit prior state for
        // ref items.
        let merge_items: Vec<WorkItem> =
            self.description.items.iter().filter(|i| i.is_change()).cloned().collect();
        let mut item_commit = None;
        if !merge_items.is_empty() {
            match self.merger.merge_changes(&merge_items, &self.description.repo_state) {
                Ok(Some(commit)) => item_commit = Some(commit),
                Ok(None) => {
                    tracing::info!(build = %self.build, "merge conflict");
                    return Ok(BuildResult::new(BuildOutcome::MergerFailure));
                }
                Err(MergerError::Rejected(reason)) => {
                    tracing::warn!(build = %self.build, %reason, "merger rejected items");
                    return Ok(BuildResult::aborted());
                }
                Err(error) => return Err(error.into()),
            }
        }
        if self.aborted() {
            return Ok(BuildResult::aborted());
        }

        let state_items: Vec<WorkItem> =
            self.description.items.iter().filter(|i| !i.is_change()).cloned().collect();
        if !state_items.is_empty() {
            self.merger.set_repo_state(&state_items, &self.description.repo_state)?;
        }
        if self.aborted() {
            return Ok(BuildResult::aborted());
        }

        // Materialize every job project into the shared source root at its
        // resolved ref.
        let mut checkouts: HashMap<String, String> = HashMap::new();
        for project in &self.description.projects {
            let info = project_info
                .get(&(project.connection.clone(), project.name.clone()))
                .cloned()
                .unwrap_or_default();
            let event_ref = self.event_ref_for(&project.name);
            let (selected, desc) = resolve_checkout(&CheckoutQuery {
                project: &project.name,
                event_ref,
                job_branch: self.description.branch.as_deref(),
                job_override_branch: self.description.override_branch.as_deref(),
                job_override_ref: self.description.override_ref.as_deref(),
                project_override_branch: project.override_branch.as_deref(),
                project_override_ref: project.override_ref.as_deref(),
                default_branch: &project.default_branch,
                info: &info,
            })?;
            tracing::info!(build = %self.build, project = %project.name, %selected, desc,
                "checking out");
            self.merger.checkout(
                &project.connection,
                &project.name,
                &selected,
                &jobdir.src_root.join(&project.name),
            )?;
            checkouts.insert(project.name.clone(), selected);
        }
        if self.aborted() {
            return Ok(BuildResult::aborted());
        }

        let mut secrets = HashMap::new();
        let prepared = self.prepare_playbooks(jobdir, &project_info, &mut secrets)?;
        self.write_job_files(jobdir, &checkouts)?;
        self.start_port_forwards(jobdir, forwards)?;
        if self.aborted() {
            return Ok(BuildResult::aborted());
        }

        let mut ro_paths = vec![jobdir.trusted_root.clone(), jobdir.untrusted_root.clone()];
        ro_paths.extend(self.context.ro_paths.iter().cloned());
        let mut rw_paths = vec![jobdir.work_root.clone(), jobdir.tmp_root.clone()];
        rw_paths.extend(self.context.rw_paths.iter().cloned());
        let context = self.wrapper.execution_context(ro_paths, rw_paths, secrets)?;

        let mut data = self.base_work_data();
        data["url"] = json!(format!(
            "finger://{}:{}/{}",
            self.context.hostname, self.context.log_stream_port, self.build
        ));
        let _ = self.queue_job.send_work_data(&data);

        let console = ConsoleLog::open(&jobdir.job_output_file)?;
        let env = self.base_env(jobdir, agent, forwards);

        let result = self.run_playbooks(jobdir, &prepared, context.as_ref(), &env, &console);
        let success = result == Some(BuildOutcome::Success);
        self.run_cleanup_playbooks(jobdir, &prepared, context.as_ref(), &env, &console, success);

        let result = if self.aborted_reason() == Some(AbortReason::DiskFull) {
            Some(BuildOutcome::DiskFull)
        } else {
            result
        };

        let data = jobdir.read_result_data().unwrap_or(Value::Null);
        let mut warnings = Vec::new();
        let data = self.map_comment_lines(data, item_commit.as_deref(), &mut warnings);
        Ok(BuildResult {
            result,
            warnings,
            data,
            error_detail: None,
        })
    }

    /// Fetch every repository the build references, deduplicated across
    /// concurrent builds. Any fetch failure is fatal.
    fn update_repositories(&self) -> Result<ProjectInfo, ExecutorError> {
        let mut pending: Vec<Arc<UpdateTask>> = Vec::new();
        let mut seen: Vec<(String, String)> = Vec::new();
        let mut submit = |connection: &str, project: &str, updates: &DeduplicateQueue| {
            let key = (connection.to_string(), project.to_string());
            if seen.contains(&key) {
                return;
            }
            tracing::debug!(build = %self.build, connection, project, "updating repository");
            pending.push(updates.put(UpdateTask::new(
                connection,
                project,
                self.description.repo_state.clone(),
            )));
            seen.push(key);
        };

        for project in &self.description.projects {
            submit(&project.connection, &project.name, &self.updates);
        }
        for playbook in self.description.all_playbooks() {
            submit(&playbook.connection, &playbook.project, &self.updates);
            for role in &playbook.roles {
                submit(&role.connection, &role.project, &self.updates);
            }
        }

        let mut info = ProjectInfo::new();
        for task in pending {
            let (success, update) = task.wait();
            if !success {
                return Err(ExecutorError::UpdateFailed {
                    connection: task.connection.clone(),
                    project: task.project.clone(),
                });
            }
            info.insert(
                (task.connection.clone(), task.project.clone()),
                update.unwrap_or_default(),
            );
        }
        tracing::debug!(build = %self.build, "repository updates complete");
        Ok(info)
    }

    /// The triggering event's ref applies only to the project the event
    /// belongs to, and only when the job carries no branch.
    fn event_ref_for(&self, project: &str) -> Option<&str> {
        if self.description.branch.is_some() {
            return None;
        }
        if self.description.triggering_project.as_deref() != Some(project) {
            return None;
        }
        self.description.event_ref.as_deref()
    }

    fn prepare_playbooks(
        &self,
        jobdir: &mut JobDir,
        info: &ProjectInfo,
        secrets: &mut HashMap<PathBuf, String>,
    ) -> Result<Prepared, ExecutorError> {
        let host_key_checking = inventory::all_hosts_have_keys(&self.description);
        write_ansible_config(
            jobdir,
            &jobdir.setup_playbook,
            &self.context.runner,
            host_key_checking,
            false,
        )?;

        let description = self.description.clone();
        let mut prepare_phase = |specs: &[PlaybookSpec],
                                 phase: Phase,
                                 jobdir: &mut JobDir|
         -> Result<Vec<JobDirPlaybook>, ExecutorError> {
            let mut out = Vec::new();
            for spec in specs {
                out.push(self.prepare_playbook(jobdir, info, spec, phase, secrets)?);
            }
            Ok(out)
        };

        let pre = prepare_phase(&description.pre_playbooks, Phase::Pre, jobdir)?;
        let run = prepare_phase(&description.playbooks, Phase::Run, jobdir)?;
        if run.is_empty() {
            return Err(ExecutorError::NoPlaybook);
        }
        let post = prepare_phase(&description.post_playbooks, Phase::Post, jobdir)?;
        let cleanup = prepare_phase(&description.cleanup_playbooks, Phase::Cleanup, jobdir)?;
        Ok(Prepared { pre, run, post, cleanup })
    }

    fn prepare_playbook(
        &self,
        jobdir: &mut JobDir,
        info: &ProjectInfo,
        spec: &PlaybookSpec,
        phase: Phase,
        secrets: &mut HashMap<PathBuf, String>,
    ) -> Result<JobDirPlaybook, ExecutorError> {
        tracing::debug!(
            build = %self.build,
            trust = %spec.trust,
            project = %spec.project,
            branch = %spec.branch,
            path = %spec.path,
            "preparing playbook"
        );
        let mut playbook = jobdir.add_playbook(phase, spec.trust)?;
        playbook.project = Some(spec.project.clone());
        playbook.branch = Some(spec.branch.clone());

        let repo = self.checkout_playbook_repo(
            jobdir,
            spec.trust,
            &spec.connection,
            &spec.project,
            &spec.branch,
        )?;
        let path = repo.join(&spec.path);
        if !path.is_file() {
            return Err(ExecutorError::PlaybookNotFound {
                path: spec.path.clone(),
                project: spec.project.clone(),
                branch: spec.branch.clone(),
            });
        }
        if spec.trust == Trust::Untrusted {
            block_adjacent_plugin_dirs(&path)?;
        }
        playbook.path = Some(path);

        for role in &spec.roles {
            self.prepare_role(jobdir, info, &mut playbook, role)?;
        }

        if let Some(payload) = &spec.secrets {
            secrets.insert(
                playbook.secrets_file.clone(),
                serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
            );
        }
        let host_key_checking = inventory::all_hosts_have_keys(&self.description);
        // The secrets file itself is only written when the execution context
        // is created, so secret presence comes from the spec, not the disk.
        write_ansible_config(
            jobdir,
            &playbook,
            &self.context.runner,
            host_key_checking,
            spec.secrets.is_some(),
        )?;
        Ok(playbook)
    }

    fn checkout_playbook_repo(
        &self,
        jobdir: &mut JobDir,
        trust: Trust,
        connection: &str,
        project: &str,
        branch: &str,
    ) -> Result<PathBuf, ExecutorError> {
        let (path, created) = match trust {
            Trust::Trusted => jobdir.add_trusted_project(project, branch)?,
            Trust::Untrusted => jobdir.add_untrusted_project(project, branch)?,
        };
        if created {
            tracing::debug!(build = %self.build, %trust, project, branch,
                "cloning into new checkout root");
            self.merger.checkout(connection, project, branch, &path)?;
        }
        Ok(path)
    }

    fn prepare_role(
        &self,
        jobdir: &mut JobDir,
        info: &ProjectInfo,
        playbook: &mut JobDirPlaybook,
        role: &gg_core::RoleSpec,
    ) -> Result<(), ExecutorError> {
        if role.target_name.contains('/') || role.target_name.contains("..") {
            return Err(ExecutorError::RoleNotFound {
                role: role.target_name.clone(),
                project: role.project.clone(),
            });
        }
        let root = playbook.add_role()?;

        // Follow the playbook's own branch when the role lives in the
        // playbook's project; otherwise the normal resolution order.
        let branch = if playbook.project.as_deref() == Some(role.project.as_str()) {
            playbook.branch.clone().unwrap_or_else(|| role.project_default_branch.clone())
        } else {
            let spec = self.description.project(&role.project);
            let update = info
                .get(&(role.connection.clone(), role.project.clone()))
                .cloned()
                .unwrap_or_default();
            let (selected, _) = resolve_checkout(&CheckoutQuery {
                project: &role.project,
                event_ref: None,
                job_branch: self.description.branch.as_deref(),
                job_override_branch: self.description.override_branch.as_deref(),
                job_override_ref: self.description.override_ref.as_deref(),
                project_override_branch: spec.and_then(|p| p.override_branch.as_deref()),
                project_override_ref: spec.and_then(|p| p.override_ref.as_deref()),
                default_branch: &role.project_default_branch,
                info: &update,
            })?;
            selected
        };

        let repo = self.checkout_playbook_repo(
            jobdir,
            playbook.trust,
            &role.connection,
            &role.project,
            &branch,
        )?;
        let link = root.join(&role.target_name);
        std::os::unix::fs::symlink(&repo, &link)?;

        match find_role(&link, playbook.trust) {
            // A directory of roles: the interpreter searches it by name.
            Ok(Some(roles_dir)) => playbook.roles_paths.push(roles_dir),
            // A bare role: the containing directory is the search path and
            // the symlink supplies the role name.
            Ok(None) => playbook.roles_paths.push(root),
            Err(error @ (ExecutorError::RoleNotFound { .. } | ExecutorError::PluginDirFound { .. }))
                if role.implicit =>
            {
                tracing::debug!(build = %self.build, role = %role.target_name, %error,
                    "skipping implicit role");
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }

    fn write_job_files(
        &self,
        jobdir: &JobDir,
        checkouts: &HashMap<String, String>,
    ) -> Result<(), ExecutorError> {
        let mut all_vars = self.context.site_vars.clone();
        all_vars.extend(self.description.vars.clone());
        all_vars.insert("ganger".to_string(), self.ganger_vars(jobdir, checkouts));

        inventory::write_inventory(
            &jobdir.inventory,
            &inventory::build_inventory(&self.description, &all_vars, &self.context.inventory),
        )?;
        inventory::write_inventory(
            &jobdir.setup_inventory,
            &inventory::build_setup_inventory(&self.description, &self.context.inventory),
        )?;
        inventory::write_known_hosts(&jobdir.known_hosts, &self.description)?;
        write_vars_blacklist(&jobdir.vars_blacklist_file)?;
        std::fs::write(
            &jobdir.extra_vars_file,
            serde_json::to_vec_pretty(&Value::Object(self.description.extra_vars.clone()))?,
        )?;
        // Interpreter-side logging: everything to the streamed console.
        std::fs::write(
            &jobdir.logging_config,
            serde_json::to_vec_pretty(&json!({
                "version": 1,
                "console_output": jobdir.job_output_file,
            }))?,
        )?;
        Ok(())
    }

    /// Variables every playbook can read under the executor's reserved
    /// namespace.
    fn ganger_vars(&self, jobdir: &JobDir, checkouts: &HashMap<String, String>) -> Value {
        let mut projects = Map::new();
        for project in &self.description.projects {
            projects.insert(
                project.name.clone(),
                json!({
                    "connection": project.connection,
                    "checkout": checkouts.get(&project.name),
                    "default_branch": project.default_branch,
                }),
            );
        }
        json!({
            "build": self.build,
            "job": self.description.job_name,
            "branch": self.description.branch,
            "ref": self.description.event_ref,
            "timeout": self.description.timeout,
            "projects": projects,
            "executor": {
                "hostname": self.context.hostname,
                "work_root": jobdir.work_root,
                "src_root": jobdir.src_root,
                "log_root": jobdir.log_root,
                "result_data_file": jobdir.result_data_file,
                "inventory_file": jobdir.inventory,
            },
        })
    }

    fn start_port_forwards(
        &self,
        jobdir: &JobDir,
        forwards: &mut Vec<PortForward>,
    ) -> Result<(), ExecutorError> {
        for host in &self.description.nodes {
            if let gg_core::Connection::Kubectl { context, namespace, pod, config } =
                &host.connection
            {
                if let Some(config) = config {
                    if !jobdir.kube_config.exists() {
                        std::fs::write(&jobdir.kube_config, config)?;
                    }
                }
                if !jobdir.kube_config.exists() {
                    tracing::warn!(build = %self.build, host = %host.name,
                        "no kube config, skipping console forward");
                    continue;
                }
                match PortForward::start(
                    &jobdir.kube_config,
                    context,
                    namespace,
                    pod,
                    LOG_STREAM_PORT,
                ) {
                    Ok(fwd) => forwards.push(fwd),
                    // The build proceeds without console streaming for
                    // this pod; the failure is not the job's fault.
                    Err(error) => {
                        tracing::warn!(build = %self.build, host = %host.name, %error,
                            "console forward failed to start");
                    }
                }
            }
        }
        Ok(())
    }

    fn base_env(
        &self,
        jobdir: &JobDir,
        agent: Option<&SshAgent>,
        forwards: &[PortForward],
    ) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), jobdir.work_root.display().to_string());
        env.insert("TMP".to_string(), jobdir.tmp_root.display().to_string());
        if let Some(agent) = agent {
            env.extend(agent.env().clone());
        }
        if jobdir.kube_config.exists() {
            env.insert(
                "KUBECONFIG".to_string(),
                jobdir.kube_config.display().to_string(),
            );
        }
        if !forwards.is_empty() {
            let ports: Vec<String> =
                forwards.iter().map(|f| f.local_port().to_string()).collect();
            env.insert("GANGER_CONSOLE_PORTS".to_string(), ports.join(","));
        }
        env
    }

    // ---- phased execution ----

    fn run_playbooks(
        &self,
        jobdir: &JobDir,
        prepared: &Prepared,
        context: &dyn ExecutionContext,
        env: &HashMap<String, String>,
        console: &ConsoleLog,
    ) -> Option<BuildOutcome> {
        let mut result = None;

        console.line("Running connectivity probe...");
        let setup = self.run_setup(jobdir, context, env, console);
        if setup != RunOutcome::Normal(0) {
            // Likely a network problem between here and the hosts; return
            // them and let the queue reschedule the build.
            tracing::info!(build = %self.build, outcome = setup.label(), "probe failed");
            return None;
        }

        self.started.store(true, Ordering::SeqCst);
        let run_started = Instant::now();
        let job_timeout = self.description.timeout.map(Duration::from_secs);

        // The overall timeout budgets setup, pre and run together. Post
        // gets its own budget because that is where logs are collected,
        // and logs matter most for the builds that time out.
        let mut pre_failed = false;
        let mut success = false;
        for playbook in &prepared.pre {
            let timeout = remaining_time(run_started, job_timeout);
            let outcome = self.run_one(jobdir, playbook, context, env, console, timeout, None);
            if outcome != RunOutcome::Normal(0) {
                // Pre playbooks should really never fail; record the
                // pre-failure and let post collect what it can.
                pre_failed = true;
                break;
            }
        }

        if !pre_failed {
            for playbook in &prepared.run {
                let timeout = remaining_time(run_started, job_timeout);
                let outcome = self.run_one(jobdir, playbook, context, env, console, timeout, None);
                match outcome {
                    RunOutcome::Aborted => return Some(BuildOutcome::Aborted),
                    RunOutcome::TimedOut => {
                        // Keep a later post-failure from masking the
                        // timeout.
                        pre_failed = true;
                        result = Some(BuildOutcome::TimedOut);
                        break;
                    }
                    RunOutcome::Normal(0) => {
                        success = true;
                        result = Some(BuildOutcome::Success);
                    }
                    RunOutcome::Normal(_) => {
                        success = false;
                        result = Some(BuildOutcome::Failure);
                        break;
                    }
                    // Indeterminate. The queue will run it again.
                    RunOutcome::Unreachable => return None,
                }
            }
        }

        let pause_requested = jobdir
            .read_result_data()
            .and_then(|d| d.get("ganger")?.get("pause")?.as_bool())
            .unwrap_or(false);
        if success && pause_requested {
            self.pause(console);
        }
        if self.aborted() {
            return Some(BuildOutcome::Aborted);
        }

        let post_timeout = self.description.post_timeout.map(Duration::from_secs);
        let mut unreachable = false;
        for (index, playbook) in prepared.post.iter().enumerate() {
            // Each post playbook gets the full post budget.
            let outcome =
                self.run_one(jobdir, playbook, context, env, console, post_timeout, Some(success));
            if outcome == RunOutcome::Aborted {
                return Some(BuildOutcome::Aborted);
            }
            if outcome == RunOutcome::Unreachable {
                // The build must be retried, but keep running post
                // playbooks so logs still get uploaded.
                unreachable = true;
            }
            if outcome != RunOutcome::Normal(0) {
                success = false;
                if !pre_failed {
                    result = Some(BuildOutcome::PostFailure);
                }
                if index + 1 == prepared.post.len() {
                    tracing::warn!(build = %self.build,
                        "final post playbook failed; log upload may be incomplete");
                }
            }
        }

        if unreachable {
            return None;
        }
        result
    }

    fn run_cleanup_playbooks(
        &self,
        jobdir: &JobDir,
        prepared: &Prepared,
        context: &dyn ExecutionContext,
        env: &HashMap<String, String>,
        console: &ConsoleLog,
        success: bool,
    ) {
        if prepared.cleanup.is_empty() {
            return;
        }
        console.line("Running cleanup playbooks...");
        self.cleanup_started.store(true, Ordering::SeqCst);
        for playbook in &prepared.cleanup {
            // Best effort: a cleanup failure never changes the result.
            let _ = self.run_one(
                jobdir,
                playbook,
                context,
                env,
                console,
                Some(CLEANUP_TIMEOUT),
                Some(success),
            );
        }
    }

    fn run_setup(
        &self,
        jobdir: &JobDir,
        context: &dyn ExecutionContext,
        env: &HashMap<String, String>,
        console: &ConsoleLog,
    ) -> RunOutcome {
        let argv = build_setup_command(&self.context.runner, jobdir, self.context.verbose);
        let mut env = env.clone();
        env.insert(
            "ANSIBLE_CONFIG".to_string(),
            jobdir.setup_playbook.ansible_config.display().to_string(),
        );
        match run_command(
            context,
            &argv,
            &jobdir.work_root,
            &env,
            Some(self.context.setup_timeout),
            &self.proc_slot,
            console,
            &self.cpu,
            None,
            &|| self.aborted(),
        ) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(build = %self.build, %error, "probe failed to launch");
                RunOutcome::Unreachable
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_one(
        &self,
        jobdir: &JobDir,
        playbook: &JobDirPlaybook,
        context: &dyn ExecutionContext,
        env: &HashMap<String, String>,
        console: &ConsoleLog,
        timeout: Option<Duration>,
        success: Option<bool>,
    ) -> RunOutcome {
        if self.aborted() {
            return RunOutcome::Aborted;
        }
        let Some(path) = playbook.path.as_deref() else {
            return RunOutcome::Normal(0);
        };
        let phase = PhaseVars {
            phase: &playbook.phase.to_string(),
            index: playbook.index,
            trusted: playbook.trust.is_trusted(),
            success,
        };
        console.banner(&format!(
            "Running {} playbook {}: {}",
            playbook.phase,
            playbook.index,
            path.display()
        ));
        let argv = build_playbook_command(
            &self.context.runner,
            jobdir,
            playbook,
            path,
            self.context.verbose,
            &phase,
        );
        let mut env = env.clone();
        env.insert(
            "ANSIBLE_CONFIG".to_string(),
            playbook.ansible_config.display().to_string(),
        );
        let outcome = match run_command(
            context,
            &argv,
            &jobdir.work_root,
            &env,
            timeout,
            &self.proc_slot,
            console,
            &self.cpu,
            Some(&jobdir.unreachable_file),
            &|| self.aborted(),
        ) {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(build = %self.build, %error, "playbook failed to launch");
                // Indeterminate rather than a job failure.
                RunOutcome::Unreachable
            }
        };
        console.banner(&format!(
            "{} playbook {} finished: {}",
            playbook.phase,
            playbook.index,
            outcome.label()
        ));
        outcome
    }

    /// Block until resumed or aborted. Reached only after a successful run
    /// phase that explicitly requested the pause.
    fn pause(&self, console: &ConsoleLog) {
        console.line("Build paused, waiting for resume");
        let _ = self.queue_job.send_work_data(&json!({"paused": true}));
        {
            let mut control = self.control.lock();
            control.paused = true;
            while control.paused && !control.aborted {
                self.resume_cond.wait(&mut control);
            }
            control.paused = false;
        }
        console.line("Build resumed");
        let _ = self.queue_job.send_work_data(&json!({"paused": false}));
    }

    /// Map file-comment line numbers back to the pre-merge commit so
    /// review comments land on the right lines.
    fn map_comment_lines(
        &self,
        mut data: Value,
        item_commit: Option<&str>,
        warnings: &mut Vec<String>,
    ) -> Value {
        let Some(commit) = item_commit else {
            return data;
        };
        let Some(comments) = data
            .get_mut("ganger")
            .and_then(|g| g.get_mut("file_comments"))
            .and_then(Value::as_object_mut)
        else {
            return data;
        };
        for (file, entries) in comments.iter_mut() {
            let Some(entries) = entries.as_array_mut() else {
                continue;
            };
            for entry in entries {
                let Some(line) = entry.get("line").and_then(Value::as_u64) else {
                    continue;
                };
                match self.merger.map_line(commit, file, line as u32) {
                    Ok(Some(mapped)) => {
                        entry["line"] = json!(mapped);
                    }
                    Ok(None) => {
                        warnings.push(format!(
                            "Comment on {file}:{line} could not be mapped to the change"
                        ));
                    }
                    Err(error) => {
                        warnings.push(format!(
                            "Comment mapping failed for {file}:{line}: {error}"
                        ));
                    }
                }
            }
        }
        data
    }
}

/// Phase timeout left in the overall budget.
fn remaining_time(started: Instant, timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|t| t.saturating_sub(started.elapsed()))
}

// ---- checkout resolution ----

pub struct CheckoutQuery<'a> {
    pub project: &'a str,
    /// Ref carried by the triggering event, already scoped to this
    /// project.
    pub event_ref: Option<&'a str>,
    pub job_branch: Option<&'a str>,
    pub job_override_branch: Option<&'a str>,
    pub job_override_ref: Option<&'a str>,
    pub project_override_branch: Option<&'a str>,
    pub project_override_ref: Option<&'a str>,
    pub default_branch: &'a str,
    /// Branches and refs known to exist, from the repository update.
    pub info: &'a RepoUpdate,
}

/// Pick the ref to check out for one project. Fixed precedence; branch
/// candidates must exist in the fetched branch list, ref candidates in
/// the fetched ref list.
pub fn resolve_checkout(q: &CheckoutQuery<'_>) -> Result<(String, &'static str), ExecutorError> {
    let has_ref = |r: Option<&str>| r.is_some_and(|r| q.info.refs.contains_key(r));
    let has_branch = |b: Option<&str>| b.is_some_and(|b| q.info.branches.iter().any(|x| x == b));

    if has_ref(q.project_override_ref) {
        return Ok((q.project_override_ref.unwrap_or_default().to_string(), "project override ref"));
    }
    if has_branch(q.project_override_branch) {
        return Ok((
            q.project_override_branch.unwrap_or_default().to_string(),
            "project override branch",
        ));
    }
    if has_ref(q.job_override_ref) {
        return Ok((q.job_override_ref.unwrap_or_default().to_string(), "job override ref"));
    }
    if has_branch(q.job_override_branch) {
        return Ok((
            q.job_override_branch.unwrap_or_default().to_string(),
            "job override branch",
        ));
    }
    if let Some(event_ref) = q.event_ref {
        if let Some(branch) = event_ref.strip_prefix("refs/heads/") {
            return Ok((branch.to_string(), "branch ref"));
        }
        if let Some(tag) = event_ref.strip_prefix("refs/tags/") {
            return Ok((tag.to_string(), "tag ref"));
        }
    }
    if has_branch(q.job_branch) {
        return Ok((q.job_branch.unwrap_or_default().to_string(), "job branch"));
    }
    if has_branch(Some(q.default_branch)) {
        return Ok((q.default_branch.to_string(), "project default branch"));
    }
    Err(ExecutorError::UnresolvedBranch { project: q.project.to_string() })
}

// ---- untrusted tree checks ----

fn dir_entries(path: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default()
}

fn block_plugin_dirs(project: &str, path: &Path) -> Result<(), ExecutorError> {
    for entry in dir_entries(path) {
        let is_plugin_dir = entry
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("_plugins"));
        if is_plugin_dir {
            return Err(ExecutorError::PluginDirFound {
                project: project.to_string(),
                path: entry.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Plugins load from directories adjacent to the playbook, from roles
/// beside it, and from a `roles/` collection. Reject all three for
/// untrusted playbooks.
fn block_adjacent_plugin_dirs(playbook_path: &Path) -> Result<(), ExecutorError> {
    let Some(playbook_dir) = playbook_path.parent() else {
        return Ok(());
    };
    let project = playbook_dir.display().to_string();
    block_plugin_dirs(&project, playbook_dir)?;
    for entry in dir_entries(playbook_dir) {
        block_plugin_dirs(&project, &entry)?;
    }
    for entry in dir_entries(&playbook_dir.join("roles")) {
        block_plugin_dirs(&project, &entry)?;
    }
    Ok(())
}

/// Classify a role checkout: `Ok(None)` is a bare role, `Ok(Some(dir))`
/// a collection of roles under `roles/`.
fn find_role(path: &Path, trust: Trust) -> Result<Option<PathBuf>, ExecutorError> {
    let project = path.display().to_string();
    if path.join("tasks").is_dir() {
        if trust == Trust::Untrusted {
            block_plugin_dirs(&project, path)?;
        }
        return Ok(None);
    }
    let roles_dir = path.join("roles");
    if roles_dir.is_dir() {
        if trust == Trust::Untrusted {
            block_plugin_dirs(&project, &roles_dir)?;
            for entry in dir_entries(&roles_dir) {
                block_plugin_dirs(&project, &entry)?;
            }
        }
        return Ok(Some(roles_dir));
    }
    Err(ExecutorError::RoleNotFound {
        role: path.display().to_string(),
        project,
    })
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
