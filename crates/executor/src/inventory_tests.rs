// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use gg_core::{Connection, HostSpecBuilder, JobDescriptionBuilder, JobGroup};
use serde_json::{json, Map};

use super::*;

fn ssh_host(name: &str) -> HostSpec {
    HostSpecBuilder::default().name(name).interface_ip("10.0.0.7").build()
}

#[test]
fn ssh_host_variables() {
    let vars = host_variables(&ssh_host("node1"), &InventoryConfig::default());
    assert_eq!(vars["ansible_host"], json!("10.0.0.7"));
    assert_eq!(vars["ansible_connection"], json!("ssh"));
    assert_eq!(vars["ansible_port"], json!(22));
    assert!(!vars.contains_key("ansible_user"));
}

#[test]
fn falls_back_to_name_and_default_user() {
    let host = HostSpecBuilder::default().name("node1").build();
    let config = InventoryConfig {
        default_username: Some("builder".to_string()),
        ..InventoryConfig::default()
    };
    let vars = host_variables(&host, &config);
    assert_eq!(vars["ansible_host"], json!("node1"));
    assert_eq!(vars["ansible_user"], json!("builder"));
}

#[test]
fn host_username_beats_default() {
    let host = HostSpecBuilder::default().name("node1").username("admin").build();
    let config = InventoryConfig {
        default_username: Some("builder".to_string()),
        ..InventoryConfig::default()
    };
    assert_eq!(host_variables(&host, &config)["ansible_user"], json!("admin"));
}

#[test]
fn winrm_host_gets_cert_variables() {
    let host = HostSpecBuilder::default()
        .name("win1")
        .connection(Connection::Winrm)
        .build();
    let config = InventoryConfig {
        winrm_cert_pem_file: Some("/etc/certs/client.pem".to_string()),
        winrm_cert_key_file: Some("/etc/certs/client.key".to_string()),
        winrm_read_timeout: Some(120),
        ..InventoryConfig::default()
    };
    let vars = host_variables(&host, &config);
    assert_eq!(vars["ansible_connection"], json!("winrm"));
    assert_eq!(vars["ansible_winrm_cert_pem"], json!("/etc/certs/client.pem"));
    assert_eq!(vars["ansible_winrm_read_timeout_sec"], json!(120));
    assert!(!vars.contains_key("ansible_port"));
}

#[test]
fn kubectl_host_gets_pod_coordinates() {
    let host = HostSpecBuilder::default()
        .name("pod1")
        .connection(Connection::Kubectl {
            context: "build-ctx".to_string(),
            namespace: "ci".to_string(),
            pod: "builder-0".to_string(),
            config: None,
        })
        .build();
    let vars = host_variables(&host, &InventoryConfig::default());
    assert_eq!(vars["ansible_connection"], json!("kubectl"));
    assert_eq!(vars["ansible_kubectl_pod"], json!("builder-0"));
}

#[test]
fn inventory_merges_job_host_vars() {
    let mut host_vars = std::collections::HashMap::new();
    let mut extra = Map::new();
    extra.insert("role".to_string(), json!("db"));
    host_vars.insert("node1".to_string(), extra);
    let job = JobDescriptionBuilder::default()
        .nodes(vec![ssh_host("node1")])
        .host_vars(host_vars)
        .build();

    let inventory = build_inventory(&job, &Map::new(), &InventoryConfig::default());
    assert_eq!(inventory["all"]["hosts"]["node1"]["role"], json!("db"));
    assert_eq!(inventory["all"]["hosts"]["node1"]["ansible_port"], json!(22));
}

#[test]
fn inventory_carries_groups_and_shared_vars() {
    let job = JobDescriptionBuilder::default()
        .nodes(vec![ssh_host("node1"), ssh_host("node2")])
        .groups(vec![JobGroup {
            name: "switches".to_string(),
            nodes: vec!["node1".to_string()],
        }])
        .build();
    let mut all_vars = Map::new();
    all_vars.insert("ganger".to_string(), json!({"build": "b1"}));

    let inventory = build_inventory(&job, &all_vars, &InventoryConfig::default());
    assert!(inventory["all"]["children"]["switches"]["hosts"]["node1"].is_null());
    assert_eq!(inventory["all"]["vars"]["ganger"]["build"], json!("b1"));
}

#[test]
fn setup_inventory_excludes_unprobeable_hosts() {
    let pod = HostSpecBuilder::default()
        .name("pod1")
        .connection(Connection::Kubectl {
            context: "c".to_string(),
            namespace: "n".to_string(),
            pod: "p".to_string(),
            config: None,
        })
        .build();
    let appliance = HostSpecBuilder::default()
        .name("switch1")
        .connection(Connection::Network)
        .build();
    let job = JobDescriptionBuilder::default()
        .nodes(vec![ssh_host("node1"), pod, appliance])
        .build();

    let setup = build_setup_inventory(&job, &InventoryConfig::default());
    let hosts = setup["all"]["hosts"].as_object().unwrap();
    assert_eq!(hosts.len(), 1);
    assert!(hosts.contains_key("node1"));
}

#[test]
fn known_hosts_collects_all_keys() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("known_hosts");
    let mut host = ssh_host("node1");
    host.host_keys = vec!["10.0.0.7 ssh-ed25519 AAAA".to_string()];
    let job = JobDescriptionBuilder::default()
        .nodes(vec![host, ssh_host("node2")])
        .build();
    write_known_hosts(&path, &job).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "10.0.0.7 ssh-ed25519 AAAA\n");
    assert!(!all_hosts_have_keys(&job));
}

#[test]
fn hosts_without_probe_do_not_require_keys() {
    let appliance = HostSpecBuilder::default()
        .name("switch1")
        .connection(Connection::Network)
        .build();
    let job = JobDescriptionBuilder::default().nodes(vec![appliance]).build();
    assert!(all_hosts_have_keys(&job));
}
