// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reserved and protected variable names.
//!
//! Job-supplied variables may not shadow the executor's own namespace, and
//! untrusted playbooks may not override the connection variables the
//! inventory generator controls.

use crate::job::JobParseError;

/// Variable names jobs may never define. The scheduler blocks these at
/// configuration time; we block them again here so a crafted job payload
/// cannot smuggle them in.
pub const RESERVED_VAR_NAMES: &[&str] = &["ganger", "node_meta"];

/// Host-connection variables that untrusted playbooks may not override.
/// Written as a neutralizing extra-vars file into every job directory and
/// injected into untrusted playbook invocations.
pub const PROTECTED_HOST_VARS: &[&str] = &[
    "ansible_host",
    "ansible_port",
    "ansible_user",
    "ansible_connection",
    "ansible_python_interpreter",
    "ansible_shell_type",
    "ansible_ssh_executable",
    "ansible_ssh_common_args",
];

/// Reject any mapping that defines a reserved variable name.
pub fn check_varnames<'a, I>(names: I) -> Result<(), JobParseError>
where
    I: IntoIterator<Item = &'a String>,
{
    for name in names {
        if RESERVED_VAR_NAMES.contains(&name.as_str()) {
            return Err(JobParseError::ReservedVariable(name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "vars_tests.rs"]
mod tests;
