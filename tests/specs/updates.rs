// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Repository update specs.

use crate::prelude::*;

#[test]
fn one_project_updates_once_however_often_it_is_referenced() {
    let harness = Harness::start("exit 0");
    let job = harness.submit(json!({
        "build": "b-dedup",
        "job_name": "unit",
        "projects": [{
            "connection": CONNECTION,
            "name": PROJECT,
            "default_branch": "master",
        }],
        "pre_playbooks": [playbook("playbooks/pre.yaml")],
        "playbooks": [playbook("playbooks/run.yaml")],
        "post_playbooks": [playbook("playbooks/post.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));
    assert_eq!(harness.merger.update_count(), 1);
    harness.shutdown();
}

#[test]
fn distinct_projects_update_separately() {
    // The second project has no seeded template; its checkout is an
    // empty tree, which is all this build needs.
    let harness = Harness::start("exit 0");
    let job = harness.submit(json!({
        "build": "b-two",
        "job_name": "unit",
        "projects": [
            {
                "connection": CONNECTION,
                "name": PROJECT,
                "default_branch": "master",
            },
            {
                "connection": CONNECTION,
                "name": "acme/gadgets",
                "default_branch": "master",
            },
        ],
        "playbooks": [playbook("playbooks/run.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Success));
    assert_eq!(harness.merger.update_count(), 2);
    harness.shutdown();
}

#[test]
fn update_failure_surfaces_as_an_error_result() {
    let harness = Harness::start("exit 0");
    harness
        .merger
        .set_update_result(Err(gg_executor::merger::MergerError::Other(
            "remote gone".to_string(),
        )));
    let job = harness.submit(json!({
        "build": "b-noremote",
        "job_name": "unit",
        "playbooks": [playbook("playbooks/run.yaml")],
    }));

    let result = job.wait_result(SPEC_WAIT).unwrap();
    assert_eq!(result.result, Some(BuildOutcome::Error));
    harness.shutdown();
}
