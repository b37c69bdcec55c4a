// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;
use yare::parameterized;

use super::*;

#[parameterized(
    success = { BuildOutcome::Success, "SUCCESS" },
    failure = { BuildOutcome::Failure, "FAILURE" },
    post_failure = { BuildOutcome::PostFailure, "POST_FAILURE" },
    timed_out = { BuildOutcome::TimedOut, "TIMED_OUT" },
    aborted = { BuildOutcome::Aborted, "ABORTED" },
    disk_full = { BuildOutcome::DiskFull, "DISK_FULL" },
    merger_failure = { BuildOutcome::MergerFailure, "MERGER_FAILURE" },
    error = { BuildOutcome::Error, "ERROR" },
)]
fn outcome_display_matches_wire_form(outcome: BuildOutcome, expected: &str) {
    assert_eq!(outcome.to_string(), expected);
    assert_eq!(serde_json::to_value(outcome).unwrap(), json!(expected));
}

#[test]
fn run_outcome_success_is_exit_zero_only() {
    assert!(RunOutcome::Normal(0).succeeded());
    assert!(!RunOutcome::Normal(2).succeeded());
    assert!(!RunOutcome::TimedOut.succeeded());
    assert!(!RunOutcome::Aborted.succeeded());
}

#[test]
fn run_outcome_labels() {
    assert_eq!(RunOutcome::Normal(4).label(), "NORMAL");
    assert_eq!(RunOutcome::Unreachable.label(), "UNREACHABLE");
}

#[test]
fn retry_result_serializes_null_outcome() {
    let value = serde_json::to_value(BuildResult::retry()).unwrap();
    assert_eq!(value["result"], json!(null));
}

#[test]
fn error_result_carries_detail() {
    let result = BuildResult::error("merger failed to update org/project");
    assert_eq!(result.result, Some(BuildOutcome::Error));
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["error_detail"], json!("merger failed to update org/project"));
}

#[test]
fn success_result_round_trips() {
    let result = BuildResult::new(BuildOutcome::Success)
        .with_data(json!({"artifact": "log.txt"}))
        .with_warnings(vec!["slow node".to_string()]);
    let value = serde_json::to_value(&result).unwrap();
    let back: BuildResult = serde_json::from_value(value).unwrap();
    assert_eq!(back, result);
}

#[test]
fn phase_display() {
    assert_eq!(Phase::Pre.to_string(), "pre");
    assert_eq!(Phase::Cleanup.to_string(), "cleanup");
}
