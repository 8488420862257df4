//! Worker Host
//!
//! Runs QuickJS worker scripts on the worker bridge and owns the main-thread
//! loop that drains their output.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use worker_bridge::{Bridge, LOAD_EVENT, MainScope, Value, WorkerId};
use worker_bridge_quickjs::QuickJsFactory;

use crate::config::{HostConfig, Overrides, WorkerEntry};

/// Run script workers and print the events they emit
#[derive(Parser, Debug)]
#[command(name = "worker-host")]
#[command(about = "Run script workers on the worker bridge", long_about = None)]
struct Args {
    /// Path to a worker-host.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker scripts to start in addition to the configured ones
    scripts: Vec<PathBuf>,

    /// Event sent to command-line workers once loaded, as name=<json array>
    #[arg(long = "emit", value_name = "NAME=JSON")]
    emit: Vec<String>,

    /// Event name to print as a JSON line (repeatable)
    #[arg(long)]
    listen: Vec<String>,

    /// Stop after this many milliseconds
    #[arg(long)]
    run_for_ms: Option<u64>,

    /// Worker polling interval
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Wake workers as soon as an event is queued for them
    #[arg(long)]
    wake_on_push: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            scripts: self.scripts.clone(),
            emit: self.emit.clone(),
            listen: self.listen.clone(),
            run_for_ms: self.run_for_ms,
            poll_interval_ms: self.poll_interval_ms,
            wake_on_push: self.wake_on_push,
        }
    }
}

/// One printed event.
#[derive(Serialize)]
struct EventLine<'a> {
    at: DateTime<Utc>,
    worker: WorkerId,
    source: &'a str,
    event: &'a str,
    args: &'a [Value],
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(
                    "worker_host=info,worker_bridge=info,worker_bridge_quickjs=info,worker.js=info",
                )
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    config.apply(args.overrides())?;

    info!("Starting worker host v{}", env!("CARGO_PKG_VERSION"));

    let factory = QuickJsFactory::new(config.engine.clone());
    let bridge = Arc::new(Bridge::with_config(factory, config.bridge.clone()));
    let mut failures = bridge.failures();

    for entry in &config.workers {
        match start_worker(&bridge, entry, &config.host.listen) {
            Ok(id) => info!("Started worker {} for {}", id, entry.script.display()),
            Err(e) => error!("Failed to start worker for {}: {}", entry.script.display(), e),
        }
    }

    let mut ticker = tokio::time::interval(config.host.drain_interval());
    let run_for = config.host.run_for();
    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = bridge.drain_main_queue() {
                    warn!("Drain skipped: {}", e);
                }
                if bridge.workers().is_empty() && !bridge.has_retired_output() {
                    info!("All workers finished");
                    break;
                }
            }
            failure = failures.recv() => match failure {
                Ok(failure) => error!(
                    "Worker {} ({}) failed during {:?}: {}",
                    failure.worker, failure.source, failure.kind, failure.message
                ),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} worker failures", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = &mut deadline => {
                info!("Run time elapsed, shutting down...");
                break;
            }
            _ = &mut shutdown => break,
        }
    }

    // Joining worker threads blocks
    let bridge_for_shutdown = bridge.clone();
    tokio::task::spawn_blocking(move || bridge_for_shutdown.shutdown()).await?;
    // Output emitted while the workers wound down
    if let Err(e) = bridge.drain_main_queue() {
        warn!("Final drain skipped: {}", e);
    }

    info!("Worker host shutdown complete");
    Ok(())
}

/// Spawn one worker and wire its main-side handlers.
fn start_worker(
    bridge: &Bridge<QuickJsFactory>,
    entry: &WorkerEntry,
    listen: &[String],
) -> Result<WorkerId> {
    let id = bridge.create_worker(entry.script.display().to_string())?;

    let events = entry.emit.clone();
    bridge.subscribe_to_main(
        id,
        LOAD_EVENT,
        move |scope, _| {
            info!("Worker {} loaded {}", scope.id(), scope.source());
            for event in &events {
                scope.emit_to_worker(event.name.clone(), event.args.clone())?;
            }
            Ok(())
        },
        true,
    )?;

    for name in listen {
        let event = name.clone();
        bridge.subscribe_to_main(
            id,
            name.clone(),
            move |scope, args| print_event(scope, &event, args),
            false,
        )?;
    }

    Ok(id)
}

fn print_event(scope: &MainScope<'_>, event: &str, args: &[Value]) -> Result<()> {
    let line = EventLine {
        at: Utc::now(),
        worker: scope.id(),
        source: scope.source(),
        event,
        args,
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
