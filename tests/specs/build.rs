// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end build execution specs.

use crate::prelude::*;

/// Interpreter stub that records every invocation in the build's work
/// tree and emits result data from the run phase.
const PHASE_RECORDER: &str = r#"echo "$@" >> invocations.log
case "$*" in
  *ganger_execution_phase=run*) printf '{"ganger": {"artifact": "ok"}}' > results.json ;;
esac
exit 0"#;

#[test]
fn build_runs_all_phases_and_reports_result_data() {
    let harness = Harness::start_with(PHASE_RECORDER, |config| config.keep_jobdir = true);
    let job = harness.submit(json!({
        "build": "b-phases",
        "job_name": "unit",
        "pre_playbooks": [playbook("playbooks/pre.yaml")],
        "playbooks": [playbook("playbooks/run.yaml")],
        "post_playbooks": [playbook("playbooks/post.yaml")],
        "cleanup_playbooks": [playbook("playbooks/cleanup.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));
    assert_eq!(result.data["ganger"]["artifact"], json!("ok"));

    let log = std::fs::read_to_string(harness.work_file("b-phases", "invocations.log")).unwrap();
    let pre = log.find("phase=pre").unwrap();
    let run = log.find("phase=run").unwrap();
    let post = log.find("phase=post").unwrap();
    let cleanup = log.find("phase=cleanup").unwrap();
    assert!(pre < run && run < post && post < cleanup, "phases out of order:\n{log}");

    harness.shutdown();
}

#[test]
fn failing_run_reports_failure_but_still_collects_logs() {
    let script = r#"echo "$@" >> invocations.log
case "$*" in *ganger_execution_phase=run*) exit 1 ;; esac
exit 0"#;
    let harness = Harness::start_with(script, |config| config.keep_jobdir = true);
    let job = harness.submit(json!({
        "build": "b-fail",
        "job_name": "unit",
        "playbooks": [playbook("playbooks/run.yaml")],
        "post_playbooks": [playbook("playbooks/post.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Failure));

    let log = std::fs::read_to_string(harness.work_file("b-fail", "invocations.log")).unwrap();
    assert!(log.contains("phase=post"), "post should run after a failure:\n{log}");
    harness.shutdown();
}

#[test]
fn run_timeout_reports_timed_out_and_post_still_runs() {
    let script = r#"echo "$@" >> invocations.log
case "$*" in *ganger_execution_phase=run*) sleep 30 ;; esac
exit 0"#;
    let harness = Harness::start_with(script, |config| config.keep_jobdir = true);
    let job = harness.submit(json!({
        "build": "b-slow",
        "job_name": "unit",
        "timeout": 1,
        "playbooks": [playbook("playbooks/run.yaml")],
        "post_playbooks": [playbook("playbooks/post.yaml")],
        "cleanup_playbooks": [playbook("playbooks/cleanup.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::TimedOut));

    let log = std::fs::read_to_string(harness.work_file("b-slow", "invocations.log")).unwrap();
    assert!(log.contains("phase=post"), "post should run after a timeout:\n{log}");
    assert!(log.contains("phase=cleanup"), "cleanup should run after a timeout:\n{log}");
    harness.shutdown();
}

#[test]
fn unreachable_post_playbook_requests_a_retry() {
    let script = r#"case "$*" in *ganger_execution_phase=post*) exit 3 ;; esac
exit 0"#;
    let harness = Harness::start(script);
    let job = harness.submit(json!({
        "build": "b-lost",
        "job_name": "unit",
        "playbooks": [playbook("playbooks/run.yaml")],
        "post_playbooks": [playbook("playbooks/post.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, None, "an unreachable host must reschedule the build");
    harness.shutdown();
}

#[test]
fn merge_conflict_reports_merger_failure_without_running_playbooks() {
    let harness = Harness::start_with("exit 0", |config| config.keep_jobdir = true);
    harness.merger.set_merge_result(Ok(None));
    let job = harness.submit(json!({
        "build": "b-conflict",
        "job_name": "unit",
        "projects": [{
            "connection": CONNECTION,
            "name": PROJECT,
            "default_branch": "master",
        }],
        "items": [{
            "kind": "change",
            "connection": CONNECTION,
            "project": PROJECT,
            "branch": "master",
            "number": 17,
            "patchset": 2,
        }],
        "playbooks": [playbook("playbooks/run.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::MergerFailure));
    assert!(!harness.work_file("b-conflict", "invocations.log").exists());
    harness.shutdown();
}

#[test]
fn scratch_directory_is_removed_after_the_build() {
    let harness = Harness::start("exit 0");
    let job = harness.submit(json!({
        "build": "b-tidy",
        "job_name": "unit",
        "playbooks": [playbook("playbooks/run.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));
    // Cleanup happens after the result is reported.
    assert!(wait_for(SPEC_WAIT, || !harness.jobdir("b-tidy").exists()));
    harness.shutdown();
}
