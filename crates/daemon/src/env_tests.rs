// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serial_test::serial;

use super::state_dir;

#[test]
#[serial]
fn explicit_state_dir_wins() {
    std::env::set_var("GANGER_STATE_DIR", "/tmp/ganger-test-state");
    std::env::set_var("XDG_STATE_HOME", "/tmp/xdg");
    let dir = state_dir().unwrap();
    std::env::remove_var("GANGER_STATE_DIR");
    std::env::remove_var("XDG_STATE_HOME");
    assert_eq!(dir, std::path::PathBuf::from("/tmp/ganger-test-state"));
}

#[test]
#[serial]
fn xdg_state_home_is_used_when_set() {
    std::env::remove_var("GANGER_STATE_DIR");
    std::env::set_var("XDG_STATE_HOME", "/tmp/xdg");
    let dir = state_dir().unwrap();
    std::env::remove_var("XDG_STATE_HOME");
    assert_eq!(dir, std::path::PathBuf::from("/tmp/xdg/ganger"));
}
