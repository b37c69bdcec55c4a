// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stop, pause and resume specs.

use crate::prelude::*;

#[test]
fn stop_aborts_a_running_build() {
    let script = r#"case "$*" in
  *ganger_execution_phase=run*) : > started.marker; sleep 60 ;;
esac
exit 0"#;
    let harness = Harness::start(script);
    let job = harness.submit(json!({
        "build": "b-abort",
        "job_name": "unit",
        "playbooks": [playbook("playbooks/run.yaml")],
    }));

    let marker = harness.work_file("b-abort", "started.marker");
    assert!(wait_for(SPEC_WAIT, || marker.exists()), "run phase never started");
    assert!(harness.server.stop_build("b-abort"));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Aborted));
    harness.shutdown();
}

#[test]
fn stop_for_an_unknown_build_reports_not_found() {
    let harness = Harness::start("exit 0");
    assert!(!harness.server.stop_build("b-nope"));
    assert!(!harness.server.resume_build("b-nope"));
    harness.shutdown();
}

#[test]
fn build_pauses_on_request_and_resumes_to_success() {
    let script = r#"case "$*" in
  *ganger_execution_phase=run*) printf '{"ganger": {"pause": true}}' > results.json ;;
esac
exit 0"#;
    let harness = Harness::start(script);
    let job = harness.submit(json!({
        "build": "b-pause",
        "job_name": "unit",
        "playbooks": [playbook("playbooks/run.yaml")],
        "post_playbooks": [playbook("playbooks/post.yaml")],
    }));

    let paused = wait_for(SPEC_WAIT, || {
        job.data.lock().iter().any(|d| d.get("paused") == Some(&json!(true)))
    });
    assert!(paused, "build never reported the pause");
    assert!(job.result().is_none(), "build completed while paused");

    assert!(harness.server.resume_build("b-pause"));
    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));
    assert!(job
        .data
        .lock()
        .iter()
        .any(|d| d.get("paused") == Some(&json!(false))));
    harness.shutdown();
}

#[test]
fn graceful_drains_running_builds_before_stopping() {
    let script = r#"case "$*" in *ganger_execution_phase=run*) sleep 1 ;; esac
exit 0"#;
    let harness = Harness::start(script);
    let job = harness.submit(json!({
        "build": "b-drain",
        "job_name": "unit",
        "playbooks": [playbook("playbooks/run.yaml")],
    }));

    harness.server.command("graceful");
    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));
    assert!(wait_for(SPEC_WAIT, || harness.server.is_stopped()));
    harness.server.join();
}
