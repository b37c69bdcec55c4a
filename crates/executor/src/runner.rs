// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervised interpreter invocation.
//!
//! One playbook run means: assemble the interpreter argv, launch it in its
//! own process group through the build's execution context, stream its
//! output into the build console file, enforce the phase timeout with a
//! watchdog, and classify the exit into a [`RunOutcome`].

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use gg_core::{RunOutcome, Trust, PROTECTED_HOST_VARS};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::error::ExecutorError;
use crate::jobdir::{JobDir, JobDirPlaybook};
use crate::watchdog::Watchdog;
use crate::wrapper::ExecutionContext;

/// Interpreter exit code reserved for "host unreachable".
pub const EXIT_UNREACHABLE: i32 = 3;

/// How the interpreter is invoked on this node.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Playbook interpreter program.
    pub playbook_program: String,
    /// Ad-hoc interpreter program, used for the connectivity probe.
    pub adhoc_program: String,
    /// Root holding `trusted/` and `untrusted/` interpreter plugin
    /// directories, when this deployment ships any.
    pub plugin_root: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            playbook_program: "ansible-playbook".to_string(),
            adhoc_program: "ansible".to_string(),
            plugin_root: None,
        }
    }
}

pub fn log_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Append-only build console. Shared between the job thread and stream
/// readers; every line carries a timestamp so partial progress is
/// observable while the build runs.
pub struct ConsoleLog {
    file: Mutex<File>,
}

impl ConsoleLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    pub fn line(&self, text: &str) {
        let mut file = self.file.lock();
        if let Err(error) = writeln!(file, "{} | {}", log_timestamp(), text) {
            tracing::warn!(%error, "failed to write build console line");
        }
    }

    /// Phase banner, visually set off from interpreter output.
    pub fn banner(&self, text: &str) {
        self.line(&format!("=== {text} ==="));
    }
}

/// Live child process-group id, shared between the job thread and any
/// thread that wants to kill the run. Signal sends and handle updates
/// happen under one lock so a signal never targets a reaped process.
#[derive(Clone, Default)]
pub struct ProcSlot {
    pgid: Arc<Mutex<Option<i32>>>,
}

impl ProcSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, pid: i32) {
        *self.pgid.lock() = Some(pid);
    }

    fn clear(&self) {
        *self.pgid.lock() = None;
    }

    /// SIGKILL the live process group, if any. Returns whether a signal
    /// was sent.
    pub fn kill_group(&self) -> bool {
        let guard = self.pgid.lock();
        let Some(pgid) = *guard else {
            return false;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => true,
            Err(errno) => {
                tracing::debug!(pgid, %errno, "kill of process group failed");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.pgid.lock().is_some()
    }
}

/// Accumulated child CPU time for one build.
#[derive(Clone, Default)]
pub struct CpuTimes {
    seconds: Arc<Mutex<f64>>,
}

impl CpuTimes {
    pub fn total_seconds(&self) -> f64 {
        *self.seconds.lock()
    }

    /// Fold in the CPU time of a child that has exited but not been
    /// reaped yet.
    #[cfg(target_os = "linux")]
    fn record(&self, pid: u32) {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return;
        };
        // Fields after the parenthesized command name; utime and stime
        // are the 12th and 13th, in USER_HZ ticks (100 on Linux).
        let Some(rest) = stat.rsplit_once(')').map(|(_, r)| r) else {
            return;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let ticks: u64 = [fields.get(11), fields.get(12)]
            .iter()
            .flatten()
            .filter_map(|f| f.parse::<u64>().ok())
            .sum();
        *self.seconds.lock() += ticks as f64 / 100.0;
    }

    #[cfg(not(target_os = "linux"))]
    fn record(&self, _pid: u32) {}
}

/// Launch and supervise one interpreter invocation.
///
/// The child runs in its own process group so an abort or timeout kills
/// the whole interpreter tree. Output is streamed line by line into the
/// console; classification happens only after the stream closes.
#[allow(clippy::too_many_arguments)]
pub fn run_command(
    context: &dyn ExecutionContext,
    argv: &[String],
    work_dir: &Path,
    env: &HashMap<String, String>,
    timeout: Option<Duration>,
    slot: &ProcSlot,
    console: &ConsoleLog,
    cpu: &CpuTimes,
    unreachable_marker: Option<&Path>,
    aborted: &dyn Fn() -> bool,
) -> Result<RunOutcome, ExecutorError> {
    use std::os::unix::process::CommandExt;
    use std::os::unix::process::ExitStatusExt;

    let mut cmd = context.command(argv, work_dir, env)?;
    cmd.process_group(0).stdin(Stdio::null()).stdout(Stdio::piped());

    let mut child;
    {
        // Hold the slot lock across the spawn so an abort racing with us
        // either sees no process or the new one, never a stale pid. An
        // abort that already landed would have found an empty slot, so it
        // must be rechecked here or the child would outlive it.
        let mut guard = slot.pgid.lock();
        if aborted() {
            return Ok(RunOutcome::Aborted);
        }
        child = cmd.stderr(Stdio::piped()).spawn()?;
        *guard = Some(child.id() as i32);
    }
    let pid = child.id();
    tracing::debug!(pid, program = %argv.first().map(String::as_str).unwrap_or(""),
        "interpreter started");

    let mut watchdog = timeout.map(|t| {
        let slot = slot.clone();
        Watchdog::start(t, move || {
            tracing::info!(pid, "run timed out, killing process group");
            slot.kill_group();
        })
    });

    // Stderr drains on its own thread so neither pipe can fill and stall
    // the child.
    let stderr_thread = child.stderr.take().map(|stderr| {
        let reader = BufReader::new(stderr);
        std::thread::spawn(move || {
            let mut lines = Vec::new();
            for line in reader.lines().map_while(Result::ok) {
                lines.push(line);
            }
            lines
        })
    });

    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            console.line(&line);
        }
    }
    if let Some(handle) = stderr_thread {
        if let Ok(lines) = handle.join() {
            for line in lines {
                console.line(&line);
            }
        }
    }

    // The stream has closed; the process is exiting or already a zombie.
    // Account its CPU time before reaping makes /proc disappear.
    cpu.record(pid);
    let status = child.wait();
    slot.clear();
    let timed_out = watchdog.as_mut().map(|w| {
        w.stop();
        w.timed_out()
    });

    let status = status?;
    if timed_out == Some(true) {
        return Ok(RunOutcome::TimedOut);
    }
    if status.signal().is_some() {
        return Ok(RunOutcome::Aborted);
    }
    let code = status.code().unwrap_or(-1);
    let unreachable = unreachable_marker.is_some_and(|p| {
        std::fs::metadata(p).map(|m| m.len() > 0).unwrap_or(false)
    });
    if code == EXIT_UNREACHABLE || unreachable {
        return Ok(RunOutcome::Unreachable);
    }
    Ok(RunOutcome::Normal(code))
}

// ---- interpreter configuration ----

/// Write the per-playbook interpreter config. Trusted playbooks get the
/// unrestricted plugin set; untrusted ones get the restricted set and may
/// not print task arguments when secrets are in play.
pub fn write_ansible_config(
    jobdir: &JobDir,
    playbook: &JobDirPlaybook,
    config: &RunnerConfig,
    host_key_checking: bool,
    has_secrets: bool,
) -> io::Result<()> {
    let mut cfg = String::new();
    cfg.push_str("[defaults]\n");
    cfg.push_str(&format!("inventory = {}\n", jobdir.inventory.display()));
    cfg.push_str(&format!("local_tmp = {}\n", jobdir.tmp_root.join("local").display()));
    cfg.push_str("retry_files_enabled = False\n");
    cfg.push_str("gathering = smart\n");
    cfg.push_str("fact_caching = jsonfile\n");
    cfg.push_str(&format!(
        "fact_caching_connection = {}\n",
        jobdir.fact_cache.display()
    ));
    cfg.push_str(&format!(
        "host_key_checking = {}\n",
        if host_key_checking { "True" } else { "False" }
    ));
    cfg.push_str(&format!(
        "display_args_to_stdout = {}\n",
        if has_secrets { "False" } else { "True" }
    ));
    if !playbook.roles_paths.is_empty() {
        let roles: Vec<String> =
            playbook.roles_paths.iter().map(|p| p.display().to_string()).collect();
        cfg.push_str(&format!("roles_path = {}\n", roles.join(":")));
    }
    if let Some(plugin_root) = &config.plugin_root {
        let variant = match playbook.trust {
            Trust::Trusted => "trusted",
            Trust::Untrusted => "untrusted",
        };
        cfg.push_str(&format!(
            "action_plugins = {}\n",
            plugin_root.join(variant).join("action").display()
        ));
        if playbook.trust == Trust::Untrusted {
            cfg.push_str(&format!(
                "lookup_plugins = {}\n",
                plugin_root.join(variant).join("lookup").display()
            ));
        }
    }
    cfg.push_str("\n[ssh_connection]\n");
    cfg.push_str("retries = 3\n");
    cfg.push_str(&format!("control_path_dir = {}\n", jobdir.control_path.display()));
    cfg.push_str(&format!(
        "ssh_args = -o ControlMaster=auto -o ControlPersist=60s \
         -o ServerAliveInterval=60 -o UserKnownHostsFile={}\n",
        jobdir.known_hosts.display()
    ));
    cfg.push_str("pipelining = True\n");
    std::fs::write(&playbook.ansible_config, cfg)
}

/// File neutralizing every protected connection variable, injected into
/// untrusted invocations so a speculative change cannot redirect the
/// connection.
pub fn write_vars_blacklist(path: &Path) -> io::Result<()> {
    let mut map = serde_json::Map::new();
    for name in PROTECTED_HOST_VARS {
        map.insert((*name).to_string(), serde_json::Value::Null);
    }
    std::fs::write(path, serde_json::to_vec_pretty(&serde_json::Value::Object(map))?)
}

/// Extra variables describing the phase, passed to every invocation.
pub struct PhaseVars<'a> {
    pub phase: &'a str,
    pub index: usize,
    pub trusted: bool,
    /// Success-so-far, available to post and cleanup playbooks.
    pub success: Option<bool>,
}

/// Assemble the playbook interpreter argv.
pub fn build_playbook_command(
    config: &RunnerConfig,
    jobdir: &JobDir,
    playbook: &JobDirPlaybook,
    playbook_path: &Path,
    verbose: bool,
    phase: &PhaseVars<'_>,
) -> Vec<String> {
    let mut cmd = vec![config.playbook_program.clone()];
    if verbose {
        cmd.push("-vvv".to_string());
    }
    cmd.push(playbook_path.display().to_string());
    if playbook.has_secrets() {
        cmd.push("-e".to_string());
        cmd.push(format!("@{}", playbook.secrets_file.display()));
    }
    cmd.push("-e".to_string());
    cmd.push(format!("@{}", jobdir.extra_vars_file.display()));
    if playbook.trust == Trust::Untrusted {
        cmd.push("-e".to_string());
        cmd.push(format!("@{}", jobdir.vars_blacklist_file.display()));
    }
    if let Some(success) = phase.success {
        cmd.push("-e".to_string());
        cmd.push(format!("ganger_success={success}"));
    }
    cmd.push("-e".to_string());
    cmd.push(format!("ganger_execution_phase={}", phase.phase));
    cmd.push("-e".to_string());
    cmd.push(format!("ganger_execution_phase_index={}", phase.index));
    cmd.push("-e".to_string());
    cmd.push(format!("ganger_execution_trusted={}", phase.trusted));
    cmd
}

/// Assemble the ad-hoc probe argv: one fact-gathering round against every
/// probeable host.
pub fn build_setup_command(config: &RunnerConfig, jobdir: &JobDir, verbose: bool) -> Vec<String> {
    let mut cmd = vec![config.adhoc_program.clone(), "*".to_string()];
    if verbose {
        cmd.push("-vvv".to_string());
    }
    cmd.push("-i".to_string());
    cmd.push(jobdir.setup_inventory.display().to_string());
    cmd.push("-m".to_string());
    cmd.push("setup".to_string());
    cmd.push("-a".to_string());
    cmd.push("gather_subset=!all".to_string());
    cmd
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
