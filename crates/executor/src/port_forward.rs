// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-target port forward for streaming logs out of kubectl-connected
//! hosts.
//!
//! Pod targets have no routable address for the log streamer, so each one
//! gets a local `kubectl port-forward` tunnel for the duration of the
//! build.

use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PortForward {
    child: Child,
    local_port: u16,
    pod: String,
}

impl PortForward {
    /// Forward a local ephemeral port to `remote_port` on the pod. Blocks
    /// until the tunnel reports its listen address or the spawn deadline
    /// passes.
    pub fn start(
        kube_config: &Path,
        context: &str,
        namespace: &str,
        pod: &str,
        remote_port: u16,
    ) -> io::Result<Self> {
        let mut child = Command::new("kubectl")
            .arg("--kubeconfig")
            .arg(kube_config)
            .arg("--context")
            .arg(context)
            .arg("-n")
            .arg(namespace)
            .arg("port-forward")
            .arg(format!("pod/{pod}"))
            .arg(format!(":{remote_port}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("kubectl stdout unavailable"))?;
        let deadline = Instant::now() + SPAWN_TIMEOUT;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            if Instant::now() > deadline {
                let _ = child.kill();
                return Err(io::Error::other(format!(
                    "timed out waiting for port forward to pod {pod}"
                )));
            }
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                let _ = child.kill();
                return Err(io::Error::other(format!(
                    "kubectl port-forward to pod {pod} exited before listening"
                )));
            }
            if let Some(port) = parse_forward_line(&line) {
                tracing::debug!(pod, local_port = port, "port forward established");
                return Ok(Self { child, local_port: port, pod: pod.to_string() });
            }
        }
    }

    /// Local port the tunnel listens on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stop(&mut self) {
        if let Err(error) = self.child.kill() {
            if error.kind() != io::ErrorKind::InvalidInput {
                tracing::warn!(pod = %self.pod, %error, "failed to stop port forward");
            }
        }
        let _ = self.child.wait();
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Extract the local port from kubectl's
/// `Forwarding from 127.0.0.1:33987 -> 19885` line.
fn parse_forward_line(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("Forwarding from 127.0.0.1:")?;
    let port: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::parse_forward_line;

    #[test]
    fn parses_forward_line() {
        assert_eq!(
            parse_forward_line("Forwarding from 127.0.0.1:33987 -> 19885\n"),
            Some(33987)
        );
    }

    #[test]
    fn ignores_other_output() {
        assert_eq!(parse_forward_line("Forwarding from [::1]:33987 -> 19885"), None);
        assert_eq!(parse_forward_line("error: pod not found"), None);
    }
}
