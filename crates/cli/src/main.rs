//! CLI entry point for hls-forge
//!
//! Queues each input for HLS packaging, logs job events and exits once every
//! job has finished. Ctrl-C tears the service down, killing any encoder
//! processes still running.

use clap::Parser;
use hls_forge::{Config, EncodingService, JobEventKind, JobOptions};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// hls-forge - adaptive-bitrate HLS packaging with supervised encoders
#[derive(Parser, Debug)]
#[command(name = "hls-forge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file. Defaults plus environment overrides
    /// are used when omitted and ./config.toml does not exist.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip startup checks (encoder, prober, encoder library). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Skip caption generation for every queued job
    #[arg(long, default_value = "false")]
    skip_captions: bool,

    /// Serve queue status and controls on 127.0.0.1:<PORT>
    #[arg(long)]
    status_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Source videos to package
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path).map_err(|e| format!("{}: {}", path.display(), e)),
        None if Path::new("config.toml").is_file() => {
            Config::load("config.toml").map_err(|e| format!("config.toml: {}", e))
        }
        None => Ok(Config::from_env()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "hls_forge=debug"
    } else {
        "hls_forge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let service = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        EncodingService::new_without_checks(config).await
    } else {
        match EncodingService::new(config).await {
            Ok(service) => service,
            Err(e) => {
                error!(error = %e, "Failed to initialize service");
                return ExitCode::FAILURE;
            }
        }
    };

    let plan = service.plan();
    info!(
        cores = plan.total_cores,
        parallel_jobs = plan.max_parallel_jobs,
        renditions_per_job = plan.renditions_per_job,
        "Service initialized"
    );

    if let Some(port) = args.status_port {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let server_service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = hls_forge::run_status_server(server_service, addr).await {
                error!(error = %e, "Status server stopped");
            }
        });
    }

    let mut events = service.subscribe();
    let mut pending: HashSet<String> = HashSet::new();
    let mut failed = false;

    for input in &args.inputs {
        let options = JobOptions {
            skip_captions: args.skip_captions,
            ..JobOptions::default()
        };
        match service.queue_video(input, options) {
            Ok(handle) => {
                info!(job_id = %handle.id, input = %input.display(), "Queued");
                pending.insert(handle.id);
            }
            Err(e) => {
                error!(input = %input.display(), error = %e, "Rejected");
                failed = true;
            }
        }
    }

    while !pending.is_empty() {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                let report = service.destroy().await;
                info!(
                    cancelled = report.cancelled,
                    killed = report.killed,
                    residual = report.residual,
                    "Shutdown complete"
                );
                return ExitCode::FAILURE;
            }
        };

        match &event.kind {
            JobEventKind::Progress { .. } | JobEventKind::SegmentReady { .. } => {}
            JobEventKind::Warning { stage, message } => {
                warn!(job_id = %event.job_id, stage = %stage, "{}", message);
            }
            JobEventKind::Complete { metadata } => {
                info!(
                    job_id = %event.job_id,
                    renditions = metadata.renditions.len(),
                    output_size = metadata.output_size,
                    "Complete"
                );
            }
            JobEventKind::Error { stage, message } => {
                error!(job_id = %event.job_id, stage = %stage, "{}", message);
                failed = true;
            }
            kind => info!(job_id = %event.job_id, event = kind.name()),
        }

        if event.kind.is_terminal() {
            pending.remove(&event.job_id);
        }
    }

    service.destroy().await;

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
