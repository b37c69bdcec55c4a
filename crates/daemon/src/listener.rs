// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket listeners.
//!
//! Two Unix sockets are served. The command socket takes one-word
//! operator commands per line. The queue socket speaks the JSON-line
//! protocol in [`crate::protocol`]; an `execute` submission holds its
//! connection open and receives the build's progress and terminal result
//! as events on that connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gg_core::BuildResult;
use gg_executor::queue::{QueueError, QueueJob, QueueRegistration};
use gg_executor::ExecutorServer;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};

use crate::env::VERSION;
use crate::protocol::{encode, QueueEvent, QueueRequest};

/// Local stand-in for a queue's capacity advertisement: a flag the
/// status command reports.
#[derive(Default)]
pub struct RegistrationFlag {
    accepting: AtomicBool,
}

impl RegistrationFlag {
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

impl QueueRegistration for RegistrationFlag {
    fn register(&self) -> Result<(), QueueError> {
        self.accepting.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unregister(&self) -> Result<(), QueueError> {
        self.accepting.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Bridges one accepted build back to its submitting connection.
pub struct ChannelQueueJob {
    unique: String,
    arguments: Value,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl ChannelQueueJob {
    pub fn new(
        unique: String,
        arguments: Value,
    ) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { unique, arguments, events }, rx)
    }

    fn push(&self, event: QueueEvent) -> Result<(), QueueError> {
        self.events
            .send(event)
            .map_err(|_| QueueError("queue connection closed".to_string()))
    }
}

impl QueueJob for ChannelQueueJob {
    fn unique(&self) -> &str {
        &self.unique
    }

    fn arguments(&self) -> &Value {
        &self.arguments
    }

    fn send_work_data(&self, data: &Value) -> Result<(), QueueError> {
        self.push(QueueEvent::Data { data: data.clone() })
    }

    fn send_work_complete(&self, result: &BuildResult) -> Result<(), QueueError> {
        self.push(QueueEvent::Complete { result: result.clone() })
    }

    fn send_work_exception(&self, message: &str) -> Result<(), QueueError> {
        self.push(QueueEvent::Exception { message: message.to_string() })
    }
}

/// Accept queue connections until shutdown.
pub async fn run_queue_listener(
    listener: UnixListener,
    server: Arc<ExecutorServer>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => return,
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(error) = handle_queue_connection(stream, server).await {
                            tracing::debug!(%error, "queue connection ended");
                        }
                    });
                }
                Err(error) => tracing::error!(%error, "queue accept failed"),
            },
        }
    }
}

async fn handle_queue_connection(
    stream: UnixStream,
    server: Arc<ExecutorServer>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: QueueRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(error) => {
                write_event(
                    &mut writer,
                    &QueueEvent::Error { message: format!("malformed request: {error}") },
                )
                .await?;
                continue;
            }
        };
        match request {
            QueueRequest::Execute { job } => {
                handle_execute(&mut writer, &server, job).await?;
            }
            QueueRequest::Stop { build } => {
                let found = server.stop_build(&build);
                write_event(&mut writer, &QueueEvent::Ack { build, found }).await?;
            }
            QueueRequest::Resume { build } => {
                let found = server.resume_build(&build);
                write_event(&mut writer, &QueueEvent::Ack { build, found }).await?;
            }
        }
    }
    Ok(())
}

async fn handle_execute(
    writer: &mut OwnedWriteHalf,
    server: &Arc<ExecutorServer>,
    job: Value,
) -> std::io::Result<()> {
    let Some(build) = job.get("build").and_then(Value::as_str).map(str::to_string) else {
        return write_event(
            writer,
            &QueueEvent::Error { message: "job has no build id".to_string() },
        )
        .await;
    };

    let (queue_job, mut events) = ChannelQueueJob::new(build.clone(), job);
    server.execute_job(Arc::new(queue_job));
    write_event(writer, &QueueEvent::Accepted { build }).await?;

    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        write_event(writer, &event).await?;
        if terminal {
            break;
        }
    }
    Ok(())
}

async fn write_event(writer: &mut OwnedWriteHalf, event: &QueueEvent) -> std::io::Result<()> {
    let line = encode(event).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await
}

/// Accept operator command connections until shutdown. Every line gets a
/// one-line reply; `status` replies with a JSON summary, everything else
/// dispatches to the server and replies `ok`.
pub async fn run_command_listener(
    listener: UnixListener,
    server: Arc<ExecutorServer>,
    registration: Arc<RegistrationFlag>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => return,
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    let server = Arc::clone(&server);
                    let registration = Arc::clone(&registration);
                    tokio::spawn(async move {
                        if let Err(error) =
                            handle_command_connection(stream, server, registration).await
                        {
                            tracing::debug!(%error, "command connection ended");
                        }
                    });
                }
                Err(error) => tracing::error!(%error, "command accept failed"),
            },
        }
    }
}

async fn handle_command_connection(
    stream: UnixStream,
    server: Arc<ExecutorServer>,
    registration: Arc<RegistrationFlag>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        tracing::info!(command, "received operator command");
        let reply = match command {
            "status" => {
                let status = serde_json::json!({
                    "version": VERSION,
                    "running_builds": server.build_count(),
                    "accepting": registration.is_accepting(),
                });
                format!("{status}\n")
            }
            // Stop and graceful trip the server's stop signal; the main
            // task observes it and shuts the listeners down.
            other => {
                server.command(other);
                "ok\n".to_string()
            }
        };
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
