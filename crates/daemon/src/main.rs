// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ggd`, the build executor daemon.
//!
//! Loads the TOML configuration, takes the state-dir PID lock, and serves
//! the queue and command sockets until an operator stop, SIGINT, or
//! SIGTERM. The executor itself runs on plain threads; tokio drives only
//! the socket surface.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use gg_daemon::config::DaemonConfig;
use gg_daemon::env::{self, VERSION};
use gg_daemon::lifecycle::{acquire_pid_lock, remove_stale_socket, LifecycleError, Paths};
use gg_daemon::listener::{run_command_listener, run_queue_listener, RegistrationFlag};
use gg_daemon::merger::CommandMerger;
use gg_executor::wrapper::NullWrapper;
use gg_executor::ExecutorServer;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(env::config_path);
    match run(config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("ggd: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: Option<PathBuf>) -> Result<(), LifecycleError> {
    let config = DaemonConfig::load(config_path.as_deref())?;
    let paths = Paths::resolve(&config)?;
    paths.create_dirs()?;

    // Lock before logging so a losing race does not rotate the winner's
    // log files.
    let _lock = acquire_pid_lock(&paths.lock_path)?;
    std::fs::write(paths.state_dir.join("version"), format!("{VERSION}\n"))?;

    let appender = tracing_appender::rolling::daily(&paths.log_dir, "ggd.log");
    let (writer, _guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    tracing::info!(version = VERSION, state_dir = %paths.state_dir.display(), "starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(&config, &paths));

    remove_stale_socket(&paths.queue_socket)?;
    remove_stale_socket(&paths.command_socket)?;
    tracing::info!("stopped");
    result
}

async fn serve(config: &DaemonConfig, paths: &Paths) -> Result<(), LifecycleError> {
    remove_stale_socket(&paths.queue_socket)?;
    remove_stale_socket(&paths.command_socket)?;
    let queue_listener = UnixListener::bind(&paths.queue_socket)?;
    let command_listener = UnixListener::bind(&paths.command_socket)?;

    let registration = Arc::new(RegistrationFlag::default());
    let merger = Arc::new(CommandMerger::new(config.merger_command()));
    let server = ExecutorServer::new(
        config.executor_config(&paths.state_dir)?,
        merger,
        Arc::new(NullWrapper),
        Arc::clone(&registration) as Arc<dyn gg_executor::queue::QueueRegistration>,
    );
    if config.paused {
        server.pause_accepting();
    }
    server.start()?;

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(run_queue_listener(
        queue_listener,
        Arc::clone(&server),
        Arc::clone(&shutdown),
    ));
    tokio::spawn(run_command_listener(
        command_listener,
        Arc::clone(&server),
        registration,
        Arc::clone(&shutdown),
    ));

    let mut sigterm = signal(SignalKind::terminate())?;
    let stopped = {
        let server = Arc::clone(&server);
        tokio::task::spawn_blocking(move || server.wait_stopped())
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt");
            server.stop();
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
            server.stop();
        }
        // An operator stop or graceful command trips the server's stop
        // signal from a command connection.
        _ = stopped => {}
    }

    shutdown.notify_waiters();
    let drained = {
        let server = Arc::clone(&server);
        tokio::task::spawn_blocking(move || server.join())
    };
    drained.await.map_err(std::io::Error::other)?;
    Ok(())
}
