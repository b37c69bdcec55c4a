// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job description: the immutable input to one build execution.
//!
//! A [`JobDescription`] is parsed once from the queue payload and validated
//! up front (reserved variable names, connection variants), so the executor
//! can match exhaustively instead of probing for optional keys.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vars::check_varnames;

crate::define_id! {
    /// Unique identifier for one build (one accepted queue job).
    ///
    /// Assigned by the queue; also names the build's job directory so the
    /// log streamer can find its output.
    pub struct BuildId;
}

/// Error raised while parsing or validating a job description.
#[derive(Debug, thiserror::Error)]
pub enum JobParseError {
    #[error("invalid job description: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("defining a variable named '{0}' is not allowed")]
    ReservedVariable(String),
}

/// Trust level of a playbook, controlling sandbox restrictions.
///
/// Trusted playbooks come from operator-controlled configuration; untrusted
/// playbooks may originate from speculative changes and run with restricted
/// command execution and no custom plugin directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    Trusted,
    Untrusted,
}

crate::simple_display! {
    Trust {
        Trusted => "trusted",
        Untrusted => "untrusted",
    }
}

impl Trust {
    pub fn is_trusted(self) -> bool {
        matches!(self, Trust::Trusted)
    }
}

/// How the interpreter connects to a target host.
///
/// One variant per connection type so later code can match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Connection {
    Ssh {
        #[serde(default = "default_ssh_port")]
        port: u16,
    },
    Winrm,
    Kubectl {
        context: String,
        namespace: String,
        pod: String,
        /// Serialized kubeconfig granting access to the pod, written into
        /// the job's work tree.
        #[serde(default)]
        config: Option<String>,
    },
    /// Network appliances: no shell to probe, excluded from the setup
    /// inventory.
    Network,
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for Connection {
    fn default() -> Self {
        Connection::Ssh { port: default_ssh_port() }
    }
}

impl Connection {
    /// Connection plugin name as the interpreter knows it.
    pub fn interpreter_name(&self) -> &'static str {
        match self {
            Connection::Ssh { .. } => "ssh",
            Connection::Winrm => "winrm",
            Connection::Kubectl { .. } => "kubectl",
            Connection::Network => "network_cli",
        }
    }

    /// Whether the host can answer the connectivity probe that runs before
    /// any playbook. Network and kubectl targets cannot.
    pub fn probeable(&self) -> bool {
        matches!(self, Connection::Ssh { .. } | Connection::Winrm)
    }

    /// Port used for host-key entries; only meaningful for SSH.
    pub fn ssh_port(&self) -> Option<u16> {
        match self {
            Connection::Ssh { port } => Some(*port),
            _ => None,
        }
    }
}

/// One target host from the job's node set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    #[serde(default)]
    pub interface_ip: Option<String>,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub username: Option<String>,
    /// Remote python interpreter path; "auto" when unset.
    #[serde(default)]
    pub python_path: Option<String>,
    #[serde(default)]
    pub shell_type: Option<String>,
    /// Known host keys. Empty means host-key checking is disabled for this
    /// host.
    #[serde(default)]
    pub host_keys: Vec<String>,
}

/// Named group of hosts, carried into the generated inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGroup {
    pub name: String,
    pub nodes: Vec<String>,
}

/// One source repository the job depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub connection: String,
    pub name: String,
    #[serde(default)]
    pub override_branch: Option<String>,
    #[serde(default)]
    pub override_ref: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "master".to_string()
}

/// A role required by a playbook, resolved from its own repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub connection: String,
    pub project: String,
    /// Name the role is linked as inside the playbook's role directory.
    pub target_name: String,
    /// Implicit roles are added by the scheduler; a missing implicit role
    /// is skipped rather than fatal.
    #[serde(default)]
    pub implicit: bool,
    #[serde(default = "default_branch")]
    pub project_default_branch: String,
}

/// One playbook instance, belonging to a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookSpec {
    pub connection: String,
    pub project: String,
    pub branch: String,
    /// Path of the playbook file relative to the project root.
    pub path: String,
    pub trust: Trust,
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
    /// Secret payload written to the playbook's private secrets file.
    #[serde(default)]
    pub secrets: Option<Map<String, Value>>,
}

/// A unit of work to apply before checkout: either a proposed change to
/// merge speculatively, or an explicit prior repository state to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Change {
        connection: String,
        project: String,
        branch: String,
        number: u64,
        patchset: u64,
    },
    Ref {
        connection: String,
        project: String,
        ref_name: String,
        new_rev: String,
    },
}

impl WorkItem {
    pub fn is_change(&self) -> bool {
        matches!(self, WorkItem::Change { .. })
    }

    pub fn project(&self) -> &str {
        match self {
            WorkItem::Change { project, .. } | WorkItem::Ref { project, .. } => project,
        }
    }

    pub fn connection(&self) -> &str {
        match self {
            WorkItem::Change { connection, .. } | WorkItem::Ref { connection, .. } => connection,
        }
    }
}

/// Snapshot of exact repository refs to build against:
/// connection → project → ref name → sha.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoState(pub BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>);

impl RepoState {
    /// Refs pinned for one (connection, project) pair, if any.
    pub fn project_state(
        &self,
        connection: &str,
        project: &str,
    ) -> Option<&BTreeMap<String, String>> {
        self.0.get(connection).and_then(|c| c.get(project))
    }
}

/// An SSH key to load into the build's credential agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub name: String,
    pub key: String,
}

/// Immutable input to one build execution. Created once per accepted queue
/// job; never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    /// Field name `build_id` keeps the generated builder's setter clear of
    /// its `build()` finisher; the wire name stays `build`.
    #[serde(rename = "build")]
    pub build_id: BuildId,
    pub job_name: String,

    /// The project the triggering event belongs to.
    #[serde(default)]
    pub triggering_project: Option<String>,
    /// Explicit ref carried by the triggering event (e.g. a tag push).
    #[serde(default)]
    pub event_ref: Option<String>,
    /// The job's declared branch.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub override_branch: Option<String>,
    #[serde(default)]
    pub override_ref: Option<String>,

    /// Overall timeout in seconds, covering setup, pre-run, and run phases.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Per-playbook post-run timeout in seconds.
    #[serde(default)]
    pub post_timeout: Option<u64>,

    #[serde(default)]
    pub nodes: Vec<HostSpec>,
    #[serde(default)]
    pub groups: Vec<JobGroup>,
    #[serde(default)]
    pub projects: Vec<ProjectSpec>,

    #[serde(default)]
    pub pre_playbooks: Vec<PlaybookSpec>,
    #[serde(default)]
    pub playbooks: Vec<PlaybookSpec>,
    #[serde(default)]
    pub post_playbooks: Vec<PlaybookSpec>,
    #[serde(default)]
    pub cleanup_playbooks: Vec<PlaybookSpec>,

    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(default)]
    pub extra_vars: Map<String, Value>,
    #[serde(default)]
    pub host_vars: HashMap<String, Map<String, Value>>,
    #[serde(default)]
    pub group_vars: HashMap<String, Map<String, Value>>,

    #[serde(default)]
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub repo_state: RepoState,
    #[serde(default)]
    pub ssh_keys: Vec<SshKey>,
}

impl JobDescription {
    /// Parse and validate a job description from its queue payload.
    pub fn parse(payload: &Value) -> Result<Self, JobParseError> {
        let job: JobDescription = serde_json::from_value(payload.clone())?;
        job.validate()?;
        Ok(job)
    }

    fn validate(&self) -> Result<(), JobParseError> {
        check_varnames(self.vars.keys())?;
        check_varnames(self.extra_vars.keys())?;
        for vars in self.host_vars.values() {
            check_varnames(vars.keys())?;
        }
        for vars in self.group_vars.values() {
            check_varnames(vars.keys())?;
        }
        for playbook in self.all_playbooks() {
            if let Some(secrets) = &playbook.secrets {
                check_varnames(secrets.keys())?;
            }
        }
        Ok(())
    }

    /// All playbooks in execution order: pre, run, post, cleanup.
    pub fn all_playbooks(&self) -> impl Iterator<Item = &PlaybookSpec> {
        self.pre_playbooks
            .iter()
            .chain(&self.playbooks)
            .chain(&self.post_playbooks)
            .chain(&self.cleanup_playbooks)
    }

    /// The spec entry for a project, if the job lists it.
    pub fn project(&self, name: &str) -> Option<&ProjectSpec> {
        self.projects.iter().find(|p| p.name == name)
    }
}

#[cfg(any(test, feature = "test-support"))]
crate::builder! {
    pub struct JobDescriptionBuilder => JobDescription {
        into {
            job_name: String = "test-job",
        }
        set {
            build_id: BuildId = BuildId::new(),
            nodes: Vec<HostSpec> = Vec::new(),
            groups: Vec<JobGroup> = Vec::new(),
            projects: Vec<ProjectSpec> = Vec::new(),
            pre_playbooks: Vec<PlaybookSpec> = Vec::new(),
            playbooks: Vec<PlaybookSpec> = Vec::new(),
            post_playbooks: Vec<PlaybookSpec> = Vec::new(),
            cleanup_playbooks: Vec<PlaybookSpec> = Vec::new(),
            vars: Map<String, Value> = Map::new(),
            extra_vars: Map<String, Value> = Map::new(),
            host_vars: HashMap<String, Map<String, Value>> = HashMap::new(),
            group_vars: HashMap<String, Map<String, Value>> = HashMap::new(),
            items: Vec<WorkItem> = Vec::new(),
            repo_state: RepoState = RepoState::default(),
            ssh_keys: Vec<SshKey> = Vec::new(),
        }
        option {
            triggering_project: String = None,
            event_ref: String = None,
            branch: String = None,
            override_branch: String = None,
            override_ref: String = None,
            timeout: u64 = None,
            post_timeout: u64 = None,
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
crate::builder! {
    pub struct HostSpecBuilder => HostSpec {
        into {
            name: String = "node1",
        }
        set {
            connection: Connection = Connection::default(),
            host_keys: Vec<String> = Vec::new(),
        }
        option {
            interface_ip: String = None,
            username: String = None,
            python_path: String = None,
            shell_type: String = None,
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
