// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration.
//!
//! Loaded from a TOML file; every key has a default so an empty file (or
//! no file at all) yields a runnable configuration rooted in the state
//! directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gg_executor::inventory::InventoryConfig;
use gg_executor::runner::RunnerConfig;
use gg_executor::ExecutorConfig;
use serde::Deserialize;

use crate::env;
use crate::lifecycle::LifecycleError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("invalid config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },

    #[error("unable to read variables file {path}: {source}")]
    Variables { path: PathBuf, source: std::io::Error },

    #[error("variables file {path} is not a JSON object")]
    VariablesShape { path: PathBuf },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// State directory override; the environment resolution applies when
    /// unset.
    pub state_dir: Option<PathBuf>,
    /// Build scratch root; defaults to `<state>/builds`.
    pub jobs_root: Option<PathBuf>,
    pub command_socket: Option<PathBuf>,
    pub queue_socket: Option<PathBuf>,
    pub hostname: Option<String>,

    pub load_multiplier: Option<f64>,
    pub min_avail_mem: Option<f64>,
    pub min_avail_hdd: Option<f64>,
    pub disk_limit_per_job_mb: Option<i64>,
    pub max_starting_builds: Option<usize>,
    pub setup_timeout_secs: Option<u64>,
    pub governor_interval_secs: Option<u64>,
    pub log_stream_port: Option<u16>,

    pub keep_jobdir: bool,
    pub verbose: bool,
    /// Start with queue registration paused.
    pub paused: bool,

    pub playbook_command: Option<String>,
    pub adhoc_command: Option<String>,
    pub plugin_root: Option<PathBuf>,

    pub default_username: Option<String>,
    pub winrm_cert_key_file: Option<String>,
    pub winrm_cert_pem_file: Option<String>,
    pub winrm_operation_timeout_secs: Option<u64>,
    pub winrm_read_timeout_secs: Option<u64>,

    /// JSON file of site-wide variables merged under every job's vars.
    pub variables_file: Option<PathBuf>,
    /// Extra read-only sandbox paths for every build.
    pub trusted_ro_paths: Vec<PathBuf>,
    /// Extra read-write sandbox paths for every build.
    pub trusted_rw_paths: Vec<PathBuf>,

    /// External merge helper invoked with JSON on stdin/stdout.
    pub merger_command: Option<PathBuf>,
}

impl DaemonConfig {
    /// Load from `path`, or defaults when no file is given or present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn state_dir(&self) -> Result<PathBuf, LifecycleError> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => env::state_dir(),
        }
    }

    pub fn command_socket(&self, state_dir: &Path) -> PathBuf {
        self.command_socket
            .clone()
            .unwrap_or_else(|| state_dir.join("command.sock"))
    }

    pub fn queue_socket(&self, state_dir: &Path) -> PathBuf {
        self.queue_socket
            .clone()
            .unwrap_or_else(|| state_dir.join("queue.sock"))
    }

    pub fn merger_command(&self) -> PathBuf {
        self.merger_command
            .clone()
            .unwrap_or_else(|| PathBuf::from("gg-merge-helper"))
    }

    /// Materialize the executor configuration, reading the site variables
    /// file if one is configured.
    pub fn executor_config(&self, state_dir: &Path) -> Result<ExecutorConfig, ConfigError> {
        let defaults = ExecutorConfig::default();
        let mut runner = RunnerConfig::default();
        if let Some(program) = &self.playbook_command {
            runner.playbook_program = program.clone();
        }
        if let Some(program) = &self.adhoc_command {
            runner.adhoc_program = program.clone();
        }
        runner.plugin_root = self.plugin_root.clone();

        let inventory = InventoryConfig {
            default_username: self.default_username.clone(),
            winrm_cert_key_file: self.winrm_cert_key_file.clone(),
            winrm_cert_pem_file: self.winrm_cert_pem_file.clone(),
            winrm_operation_timeout: self.winrm_operation_timeout_secs,
            winrm_read_timeout: self.winrm_read_timeout_secs,
        };

        let site_vars = match &self.variables_file {
            Some(path) => read_site_vars(path)?,
            None => serde_json::Map::new(),
        };

        Ok(ExecutorConfig {
            jobs_root: self
                .jobs_root
                .clone()
                .unwrap_or_else(|| state_dir.join("builds")),
            hostname: self.hostname.clone().unwrap_or(defaults.hostname),
            load_multiplier: self.load_multiplier.unwrap_or(defaults.load_multiplier),
            min_avail_mem: self.min_avail_mem.unwrap_or(defaults.min_avail_mem),
            min_avail_hdd: self.min_avail_hdd.unwrap_or(defaults.min_avail_hdd),
            disk_limit_per_job_mb: self
                .disk_limit_per_job_mb
                .unwrap_or(defaults.disk_limit_per_job_mb),
            max_starting_builds: self
                .max_starting_builds
                .unwrap_or(defaults.max_starting_builds),
            keep_jobdir: self.keep_jobdir,
            verbose: self.verbose,
            log_stream_port: self.log_stream_port.unwrap_or(defaults.log_stream_port),
            setup_timeout: self
                .setup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.setup_timeout),
            governor_interval: self
                .governor_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.governor_interval),
            site_vars,
            ro_paths: self.trusted_ro_paths.clone(),
            rw_paths: self.trusted_rw_paths.clone(),
            runner,
            inventory,
        })
    }
}

fn read_site_vars(
    path: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Variables {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|_| ConfigError::VariablesShape {
            path: path.to_path_buf(),
        })?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ConfigError::VariablesShape { path: path.to_path_buf() }),
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
