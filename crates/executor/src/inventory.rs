// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inventory generation: target hosts and their connection variables.
//!
//! Two inventories are written per build. The full inventory drives every
//! playbook phase; the setup inventory drives the connectivity probe and
//! excludes hosts whose connection type has no shell to probe.

use std::io;
use std::path::Path;

use gg_core::{Connection, HostSpec, JobDescription};
use serde_json::{json, Map, Value};

/// Node-level connection defaults from the executor config.
#[derive(Debug, Clone, Default)]
pub struct InventoryConfig {
    /// Login user when the host spec names none.
    pub default_username: Option<String>,
    pub winrm_cert_key_file: Option<String>,
    pub winrm_cert_pem_file: Option<String>,
    pub winrm_operation_timeout: Option<u64>,
    pub winrm_read_timeout: Option<u64>,
}

/// Connection variables for one host, before job-level host vars are
/// merged in.
pub fn host_variables(host: &HostSpec, config: &InventoryConfig) -> Map<String, Value> {
    let mut vars = Map::new();
    let address = host.interface_ip.as_deref().unwrap_or(&host.name);
    vars.insert("ansible_host".to_string(), json!(address));
    vars.insert(
        "ansible_connection".to_string(),
        json!(host.connection.interpreter_name()),
    );
    if let Some(user) = host.username.as_deref().or(config.default_username.as_deref()) {
        vars.insert("ansible_user".to_string(), json!(user));
    }
    if let Some(python) = &host.python_path {
        vars.insert("ansible_python_interpreter".to_string(), json!(python));
    }
    if let Some(shell) = &host.shell_type {
        vars.insert("ansible_shell_type".to_string(), json!(shell));
    }
    match &host.connection {
        Connection::Ssh { port } => {
            vars.insert("ansible_port".to_string(), json!(port));
        }
        Connection::Winrm => {
            if let Some(pem) = &config.winrm_cert_pem_file {
                vars.insert("ansible_winrm_cert_pem".to_string(), json!(pem));
            }
            if let Some(key) = &config.winrm_cert_key_file {
                vars.insert("ansible_winrm_cert_key_pem".to_string(), json!(key));
            }
            if let Some(t) = config.winrm_operation_timeout {
                vars.insert("ansible_winrm_operation_timeout_sec".to_string(), json!(t));
            }
            if let Some(t) = config.winrm_read_timeout {
                vars.insert("ansible_winrm_read_timeout_sec".to_string(), json!(t));
            }
        }
        Connection::Kubectl { context, namespace, pod, .. } => {
            vars.insert("ansible_kubectl_context".to_string(), json!(context));
            vars.insert("ansible_kubectl_namespace".to_string(), json!(namespace));
            vars.insert("ansible_kubectl_pod".to_string(), json!(pod));
        }
        Connection::Network => {}
    }
    vars
}

fn host_entry(
    host: &HostSpec,
    job: &JobDescription,
    config: &InventoryConfig,
) -> Map<String, Value> {
    let mut vars = host_variables(host, config);
    if let Some(extra) = job.host_vars.get(&host.name) {
        for (key, value) in extra {
            vars.insert(key.clone(), value.clone());
        }
    }
    vars
}

/// Full inventory covering every target host and group.
pub fn build_inventory(
    job: &JobDescription,
    all_vars: &Map<String, Value>,
    config: &InventoryConfig,
) -> Value {
    let mut hosts = Map::new();
    for host in &job.nodes {
        hosts.insert(host.name.clone(), Value::Object(host_entry(host, job, config)));
    }

    let mut children = Map::new();
    for group in &job.groups {
        let mut members = Map::new();
        for name in &group.nodes {
            members.insert(name.clone(), Value::Null);
        }
        let mut entry = Map::new();
        entry.insert("hosts".to_string(), Value::Object(members));
        if let Some(vars) = job.group_vars.get(&group.name) {
            entry.insert("vars".to_string(), Value::Object(vars.clone()));
        }
        children.insert(group.name.clone(), Value::Object(entry));
    }

    json!({
        "all": {
            "hosts": hosts,
            "children": children,
            "vars": all_vars,
        }
    })
}

/// Probe inventory: only hosts that can answer a connectivity check.
pub fn build_setup_inventory(job: &JobDescription, config: &InventoryConfig) -> Value {
    let mut hosts = Map::new();
    for host in job.nodes.iter().filter(|h| h.connection.probeable()) {
        hosts.insert(host.name.clone(), Value::Object(host_entry(host, job, config)));
    }
    json!({"all": {"hosts": hosts}})
}

pub fn write_inventory(path: &Path, inventory: &Value) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(inventory)?;
    std::fs::write(path, data)
}

/// Collect every declared host key into a known-hosts file.
pub fn write_known_hosts(path: &Path, job: &JobDescription) -> io::Result<()> {
    let mut lines = String::new();
    for host in &job.nodes {
        for key in &host.host_keys {
            lines.push_str(key);
            lines.push('\n');
        }
    }
    std::fs::write(path, lines)
}

/// Whether every host carries at least one known key; host-key checking
/// is disabled otherwise.
pub fn all_hosts_have_keys(job: &JobDescription) -> bool {
    job.nodes.iter().all(|h| {
        !h.connection.probeable() || !h.host_keys.is_empty()
    })
}

#[cfg(test)]
#[path = "inventory_tests.rs"]
mod tests;
