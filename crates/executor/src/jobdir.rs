// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Private on-disk tree for one build.
//!
//! Layout under `<jobs_root>/<build_id>/`:
//!
//! ```text
//! ansible/              generated inventories, var files, phase subtrees
//!   setup_playbook/     config for the connectivity probe
//!   pre_playbook_N/     one subtree per playbook instance
//!   playbook_N/
//!   post_playbook_N/
//!   cleanup_playbook_N/
//! trusted/project_N/    one checkout root per (project, branch)
//! untrusted/project_N/
//! work/                 the build's writable world
//!   src/  logs/  tmp/  .ssh/  .kube/
//! .ansible/             fact cache and control sockets
//! ```
//!
//! The tree belongs to exactly one build and is removed at build end
//! unless the operator keep flag is set.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use gg_core::{BuildId, Phase, Trust};

/// One playbook instance's subtree: generated config, optional secrets
/// file, and resolved role directories.
pub struct JobDirPlaybook {
    pub root: PathBuf,
    pub index: usize,
    pub phase: Phase,
    pub trust: Trust,
    /// Resolved absolute playbook path; set during preparation.
    pub path: Option<PathBuf>,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub roles_paths: Vec<PathBuf>,
    pub secrets_file: PathBuf,
    pub ansible_config: PathBuf,
    role_count: usize,
}

impl JobDirPlaybook {
    fn new(root: PathBuf, index: usize, phase: Phase, trust: Trust) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        let secrets_file = root.join("secrets.json");
        let ansible_config = root.join("ansible.cfg");
        Ok(Self {
            root,
            index,
            phase,
            trust,
            path: None,
            project: None,
            branch: None,
            roles_paths: Vec::new(),
            secrets_file,
            ansible_config,
            role_count: 0,
        })
    }

    /// Allocate a fresh numbered role directory.
    pub fn add_role(&mut self) -> io::Result<PathBuf> {
        let path = self.root.join(format!("role_{}", self.role_count));
        self.role_count += 1;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn has_secrets(&self) -> bool {
        self.secrets_file.exists()
    }
}

/// The whole per-build tree. Created at build start, deleted by
/// [`cleanup`](Self::cleanup) on every exit path.
pub struct JobDir {
    pub root: PathBuf,
    keep: bool,

    pub ansible_root: PathBuf,
    pub inventory: PathBuf,
    pub setup_inventory: PathBuf,
    pub extra_vars_file: PathBuf,
    pub vars_blacklist_file: PathBuf,
    pub logging_config: PathBuf,
    pub unreachable_file: PathBuf,
    pub setup_playbook: JobDirPlaybook,

    pub trusted_root: PathBuf,
    pub untrusted_root: PathBuf,

    pub work_root: PathBuf,
    pub src_root: PathBuf,
    pub log_root: PathBuf,
    pub tmp_root: PathBuf,
    pub job_output_file: PathBuf,
    pub result_data_file: PathBuf,

    pub ssh_root: PathBuf,
    pub known_hosts: PathBuf,
    pub kube_config: PathBuf,

    pub fact_cache: PathBuf,
    pub control_path: PathBuf,

    trusted_projects: HashMap<(String, String), PathBuf>,
    untrusted_projects: HashMap<(String, String), PathBuf>,
    playbook_counts: HashMap<Phase, usize>,
    cleaned: bool,
}

impl JobDir {
    /// Create the tree. Failure here is fatal to the build.
    pub fn new(jobs_root: &Path, keep: bool, build: &BuildId) -> io::Result<Self> {
        let root = jobs_root.join(build.as_str());
        fs::create_dir_all(&root)?;

        let ansible_root = root.join("ansible");
        fs::create_dir(&ansible_root)?;
        let setup_playbook = JobDirPlaybook::new(
            ansible_root.join("setup_playbook"),
            0,
            Phase::Setup,
            Trust::Trusted,
        )?;

        let trusted_root = root.join("trusted");
        fs::create_dir(&trusted_root)?;
        let untrusted_root = root.join("untrusted");
        fs::create_dir(&untrusted_root)?;

        let work_root = root.join("work");
        fs::create_dir(&work_root)?;
        let src_root = work_root.join("src");
        fs::create_dir(&src_root)?;
        let log_root = work_root.join("logs");
        fs::create_dir(&log_root)?;
        let tmp_root = work_root.join("tmp");
        fs::create_dir(&tmp_root)?;
        let ssh_root = work_root.join(".ssh");
        fs::create_dir(&ssh_root)?;
        let kube_root = work_root.join(".kube");
        fs::create_dir(&kube_root)?;

        let local_root = root.join(".ansible");
        let fact_cache = local_root.join("fact-cache");
        fs::create_dir_all(&fact_cache)?;
        let control_path = local_root.join("cp");
        fs::create_dir_all(&control_path)?;

        // The control node always answers fact gathering locally.
        fs::write(
            fact_cache.join("localhost"),
            serde_json::to_vec(&serde_json::json!({"module_setup": true}))?,
        )?;

        let job_output_file = log_root.join("job-output.txt");
        // Created eagerly so the log streamer can serve the file from the
        // moment the build is accepted.
        let mut output = fs::File::create(&job_output_file)?;
        writeln!(output, "{} | Build console starting...", super::runner::log_timestamp())?;

        Ok(Self {
            keep,
            inventory: ansible_root.join("inventory.json"),
            setup_inventory: ansible_root.join("setup-inventory.json"),
            extra_vars_file: ansible_root.join("extra-vars.json"),
            vars_blacklist_file: ansible_root.join("vars-blacklist.json"),
            logging_config: ansible_root.join("logging.json"),
            unreachable_file: ansible_root.join("nodes.unreachable"),
            setup_playbook,
            ansible_root,
            trusted_root,
            untrusted_root,
            src_root,
            log_root,
            tmp_root,
            job_output_file,
            result_data_file: work_root.join("results.json"),
            known_hosts: ssh_root.join("known_hosts"),
            ssh_root,
            kube_config: kube_root.join("config"),
            work_root,
            fact_cache,
            control_path,
            root,
            trusted_projects: HashMap::new(),
            untrusted_projects: HashMap::new(),
            playbook_counts: HashMap::new(),
            cleaned: false,
        })
    }

    /// Checkout root for a trusted project. Memoized per (project, branch)
    /// so playbooks sharing a source reuse one checkout; the flag reports
    /// whether this call created it.
    pub fn add_trusted_project(
        &mut self,
        canonical_name: &str,
        branch: &str,
    ) -> io::Result<(PathBuf, bool)> {
        Self::add_project_root(
            &self.trusted_root,
            &mut self.trusted_projects,
            canonical_name,
            branch,
        )
    }

    /// Checkout root for an untrusted project; same memoization.
    pub fn add_untrusted_project(
        &mut self,
        canonical_name: &str,
        branch: &str,
    ) -> io::Result<(PathBuf, bool)> {
        Self::add_project_root(
            &self.untrusted_root,
            &mut self.untrusted_projects,
            canonical_name,
            branch,
        )
    }

    fn add_project_root(
        base: &Path,
        memo: &mut HashMap<(String, String), PathBuf>,
        canonical_name: &str,
        branch: &str,
    ) -> io::Result<(PathBuf, bool)> {
        let key = (canonical_name.to_string(), branch.to_string());
        if let Some(existing) = memo.get(&key) {
            return Ok((existing.clone(), false));
        }
        let path = base.join(format!("project_{}", memo.len()));
        fs::create_dir_all(path.join(canonical_name))?;
        let checkout = path.join(canonical_name);
        memo.insert(key, checkout.clone());
        Ok((checkout, true))
    }

    /// Allocate a fresh numbered subtree for one playbook instance.
    pub fn add_playbook(&mut self, phase: Phase, trust: Trust) -> io::Result<JobDirPlaybook> {
        let count = self.playbook_counts.entry(phase).or_insert(0);
        let index = *count;
        *count += 1;
        let prefix = match phase {
            Phase::Setup => "setup_playbook",
            Phase::Pre => "pre_playbook",
            Phase::Run => "playbook",
            Phase::Post => "post_playbook",
            Phase::Cleanup => "cleanup_playbook",
        };
        JobDirPlaybook::new(
            self.ansible_root.join(format!("{prefix}_{index}")),
            index,
            phase,
            trust,
        )
    }

    /// Parse the structured result payload the automation run wrote, if
    /// any.
    pub fn read_result_data(&self) -> Option<serde_json::Value> {
        let raw = fs::read(&self.result_data_file).ok()?;
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(%error, build_dir = %self.root.display(),
                    "ignoring unparsable result data");
                None
            }
        }
    }

    /// Remove the tree unless keep was requested. Safe to call repeatedly
    /// and on every exit path.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if self.keep {
            tracing::info!(build_dir = %self.root.display(), "keeping build directory");
            return;
        }
        if let Err(error) = fs::remove_dir_all(&self.root) {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::error!(%error, build_dir = %self.root.display(),
                    "failed to remove build directory");
            }
        }
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
#[path = "jobdir_tests.rs"]
mod tests;
