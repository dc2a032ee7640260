//! Blockdump Agent - Main entry point
//!
//! Runs one changed-block backup of a VM and exits with a status reflecting
//! its outcome: 0 on success, 2 when some extents failed, 1 when aborted.

use anyhow::{Context, Result};
use blockdump_agent::cbt::FileCheckpointStore;
use blockdump_agent::config::Config;
use blockdump_agent::daemon::ShutdownCoordinator;
use blockdump_agent::executor::{BackupExecutor, BackupRequest, OperationState, OperationTracker};
use blockdump_agent::inventory::ManagedRef;
use blockdump_agent::report::{write_json_lines, EventReporter, FanoutReporter, Reporter, TracingReporter};
use blockdump_agent::repository::DirectorySink;
use blockdump_agent::transport::HttpTransport;
use blockdump_agent::utils;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Managed object id of the VM to back up (e.g. vm-42)
    #[arg(long)]
    vm: String,

    /// Device keys of the disks to back up (default: all)
    #[arg(long, value_delimiter = ',')]
    disks: Option<Vec<i32>>,

    /// Ignore checkpoints and dump every disk in full
    #[arg(long)]
    full: bool,

    /// Maximum concurrent extent transfers (overrides config)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Take a fresh snapshot before the backup (overrides config)
    #[arg(long)]
    create_snapshot: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print dump events to stdout as JSON lines
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(concurrency) = args.concurrency {
        anyhow::ensure!(concurrency > 0, "--concurrency must be at least 1");
        config.dump.concurrency = concurrency;
    }
    if args.create_snapshot {
        config.snapshot.create = true;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting blockdump-agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );
    tracing::info!("Endpoint: {}", config.endpoint.url);
    tracing::info!("Repository: {}", config.repository.root.display());

    let transport = Arc::new(HttpTransport::new(
        &config.endpoint.url,
        &config.endpoint.token,
        config.endpoint_timeout(),
    )?);
    let sink = Arc::new(DirectorySink::new(
        config.repository.root.clone(),
        config.repository.compression,
    ));
    let checkpoints = Arc::new(FileCheckpointStore::new(config.repository.checkpoint_dir.clone()));

    let mut reporters: Vec<Arc<dyn Reporter>> =
        vec![Arc::new(TracingReporter::new(config.progress_interval()))];
    let printer = if args.json_events {
        let events = EventReporter::new();
        let rx = events.subscribe();
        reporters.push(Arc::new(events));
        Some(tokio::spawn(write_json_lines(rx, std::io::stdout())))
    } else {
        None
    };
    let reporter = Arc::new(FanoutReporter::new(reporters));

    let mut request = BackupRequest::new(ManagedRef::vm(args.vm));
    request.disks = args.disks;
    request.full = args.full;

    // Signals cancel the operation through the tracker
    let tracker = OperationTracker::new();
    let cancel = tracker.register(request.operation_id).await;
    let shutdown = Arc::new(ShutdownCoordinator::new(tracker.clone()));
    let signal_shutdown = shutdown.clone();
    let signal_handle = tokio::spawn(async move {
        signal_shutdown.wait_for_signal().await;
    });

    let executor = BackupExecutor::new(transport, sink, checkpoints, reporter, config.dump_options())
        .with_cancel(cancel);
    let report = executor.execute(request).await;
    executor.wait_for_cleanup().await;
    tracker.complete(&report.operation_id).await;
    signal_handle.abort();

    // Dropping the executor closes the event channel and ends the printer
    drop(executor);
    if let Some(printer) = printer {
        let _ = tokio::time::timeout(Duration::from_secs(3), printer).await;
    }

    tracing::info!(
        operation = %report.operation_id,
        state = %report.state,
        "Backup finished"
    );

    Ok(match report.state {
        OperationState::CompletedSuccess => ExitCode::SUCCESS,
        OperationState::CompletedWithFailures => ExitCode::from(2),
        OperationState::Aborted | OperationState::Running => ExitCode::from(1),
    })
}
