// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-build ephemeral SSH credential agent.
//!
//! Each build gets its own `ssh-agent` process so its keys are never
//! visible to any other build. The agent's environment variables are
//! injected into every interpreter launch; the agent is killed when the
//! build finishes.

use std::collections::HashMap;
use std::io::{self, Write};
use std::process::{Command, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

pub struct SshAgent {
    env: HashMap<String, String>,
    pid: Option<i32>,
}

impl SshAgent {
    /// Spawn a fresh agent and capture its socket/pid environment.
    pub fn start() -> io::Result<Self> {
        let output = Command::new("ssh-agent").output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "ssh-agent exited with {}",
                output.status
            )));
        }
        let env = parse_agent_output(&String::from_utf8_lossy(&output.stdout));
        let pid = env
            .get("SSH_AGENT_PID")
            .and_then(|p| p.parse::<i32>().ok());
        if env.get("SSH_AUTH_SOCK").is_none() || pid.is_none() {
            return Err(io::Error::other("ssh-agent output missing socket or pid"));
        }
        tracing::debug!(pid = pid.unwrap_or(0), "started ssh agent");
        Ok(Self { env, pid })
    }

    /// Environment variables to inject into processes that should use this
    /// agent.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Load a private key from memory via `ssh-add -` so it never touches
    /// disk.
    pub fn add_key_data(&self, name: &str, key_data: &str) -> io::Result<()> {
        let mut child = Command::new("ssh-add")
            .arg("-")
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(key_data.as_bytes())?;
            if !key_data.ends_with('\n') {
                stdin.write_all(b"\n")?;
            }
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "ssh-add failed for key '{name}': {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(key = name, "added ssh key to agent");
        Ok(())
    }

    /// Public forms of every loaded key, one per line of `ssh-add -L`.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let output = Command::new("ssh-add").arg("-L").envs(&self.env).output()?;
        // Exit code 1 means "no identities", which is not an error here.
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Terminate the agent. Idempotent.
    pub fn stop(&mut self) {
        if let Some(pid) = self.pid.take() {
            if let Err(error) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::warn!(pid, %error, "failed to stop ssh agent");
            } else {
                tracing::debug!(pid, "stopped ssh agent");
            }
        }
    }
}

impl Drop for SshAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parse `KEY=value; export KEY;` lines from ssh-agent's setup script.
fn parse_agent_output(output: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for line in output.lines() {
        for part in line.split(';') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                if key.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
                    env.insert(key.to_string(), value.to_string());
                }
            }
        }
    }
    env
}
