// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::DaemonConfig;

#[test]
fn missing_file_yields_defaults() {
    let config = DaemonConfig::load(Some(std::path::Path::new("/nonexistent/ganger.toml")))
        .unwrap();
    assert!(config.jobs_root.is_none());
    assert!(!config.keep_jobdir);
}

#[test]
fn toml_keys_map_onto_executor_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ganger.toml");
    std::fs::write(
        &path,
        r#"
jobs_root = "/srv/builds"
hostname = "exec-7"
load_multiplier = 1.5
disk_limit_per_job_mb = 500
setup_timeout_secs = 30
governor_interval_secs = 5
keep_jobdir = true
playbook_command = "/opt/interp/bin/playbook"
default_username = "builder"
trusted_ro_paths = ["/etc/ci"]
"#,
    )
    .unwrap();

    let config = DaemonConfig::load(Some(&path)).unwrap();
    let executor = config.executor_config(dir.path()).unwrap();
    assert_eq!(executor.jobs_root, std::path::PathBuf::from("/srv/builds"));
    assert_eq!(executor.hostname, "exec-7");
    assert_eq!(executor.load_multiplier, 1.5);
    assert_eq!(executor.disk_limit_per_job_mb, 500);
    assert_eq!(executor.setup_timeout, Duration::from_secs(30));
    assert_eq!(executor.governor_interval, Duration::from_secs(5));
    assert!(executor.keep_jobdir);
    assert_eq!(executor.runner.playbook_program, "/opt/interp/bin/playbook");
    assert_eq!(executor.inventory.default_username.as_deref(), Some("builder"));
    assert_eq!(executor.ro_paths, vec![std::path::PathBuf::from("/etc/ci")]);
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ganger.toml");
    std::fs::write(&path, "no_such_key = 1\n").unwrap();
    assert!(DaemonConfig::load(Some(&path)).is_err());
}

#[test]
fn jobs_root_defaults_under_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig::default();
    let executor = config.executor_config(dir.path()).unwrap();
    assert_eq!(executor.jobs_root, dir.path().join("builds"));
}

#[test]
fn site_variables_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let vars = dir.path().join("site.json");
    std::fs::write(&vars, r#"{"site_mirror": "https://mirror.example.org"}"#).unwrap();
    let path = dir.path().join("ganger.toml");
    std::fs::write(&path, format!("variables_file = {:?}\n", vars)).unwrap();

    let config = DaemonConfig::load(Some(&path)).unwrap();
    let executor = config.executor_config(dir.path()).unwrap();
    assert_eq!(
        executor.site_vars["site_mirror"],
        serde_json::json!("https://mirror.example.org")
    );
}

#[test]
fn non_object_variables_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let vars = dir.path().join("site.json");
    std::fs::write(&vars, "[1, 2]").unwrap();
    let config = DaemonConfig {
        variables_file: Some(vars),
        ..DaemonConfig::default()
    };
    assert!(config.executor_config(dir.path()).is_err());
}
