//! Runs a particle simulation over an in-process group of nodes, one
//! thread per node, and reports timing and traffic statistics.

mod node;

use std::path::PathBuf;
use std::process;
use std::thread;

use clap::Parser;
use halo_config::{load_config, CodecKind, ConfigError, DecompositionKind, RunConfig};
use halo_decomposition::{DecompositionError, RangeError};
use halo_transport::{CommError, PayloadCodec, ProcessGroup};
use hdrhistogram::Histogram;
use log::{error, info, warn};
use thiserror::Error;

use crate::node::{run_node, NodeReport};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Range(#[from] RangeError),

    #[error("Decomposition failed: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("Communication failed: {0}")]
    Comm(#[from] CommError),

    #[error("Could not set up timing histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Node {0} panicked")]
    NodePanicked(usize),
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the run configuration (JSON, or TOML with a .toml extension)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the number of nodes
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Override the number of steps
    #[arg(short, long)]
    steps: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match prepare_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config from {}: {}", args.config.display(), e);
            process::exit(1);
        }
    };

    info!(
        "Running {} particles on {} nodes for {} steps ({:?} decomposition, {:?} codec)",
        config.particles.count, config.nodes, config.steps, config.decomposition, config.codec
    );

    let results = run_group(&config);

    let mut reports = Vec::with_capacity(results.len());
    let mut exit_code = 0;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(report) => reports.push(report),
            Err(RunnerError::Range(e)) => {
                // every node sees the same limit; report it once
                if rank == 0 {
                    warn!("{}; choose a smaller interaction_cutoff", e);
                }
                exit_code = exit_code.max(2);
            }
            Err(e) => {
                error!("rank {}: {}", rank, e);
                exit_code = 1;
            }
        }
    }

    if exit_code != 0 {
        process::exit(exit_code);
    }

    if let Err(e) = summarize(&reports) {
        error!("{}", e);
        process::exit(1);
    }
}

fn prepare_config(args: &Args) -> Result<RunConfig, ConfigError> {
    let mut config = load_config(&args.config)?;
    if let Some(nodes) = args.nodes {
        config.nodes = nodes;
    }
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    config.validate()?;
    Ok(config)
}

fn run_group(config: &RunConfig) -> Vec<Result<NodeReport, RunnerError>> {
    let codec = match config.codec {
        CodecKind::Json => PayloadCodec::Json,
        CodecKind::Binary => PayloadCodec::Binary,
    };

    match config.decomposition {
        DecompositionKind::Atom => {
            let comms = ProcessGroup::local(config.nodes, codec);
            thread::scope(|s| {
                let handles: Vec<_> = comms
                    .into_iter()
                    .map(|comm| s.spawn(move || run_node(comm, config)))
                    .collect();
                handles
                    .into_iter()
                    .enumerate()
                    .map(|(rank, h)| h.join().unwrap_or_else(|_| Err(RunnerError::NodePanicked(rank))))
                    .collect()
            })
        }
    }
}

fn summarize(reports: &[NodeReport]) -> Result<(), RunnerError> {
    let mut step_times = Histogram::<u64>::new(3)?;
    for report in reports {
        step_times
            .add(&report.step_times)
            .map_err(|e| RunnerError::Invariant(format!("merging step times of rank {}: {:?}", report.rank, e)))?;
        info!(
            "rank {}: {} particles, {} global resorts, {} ghost bytes sent",
            report.rank, report.local_particles, report.global_resorts, report.ghost_bytes
        );
    }

    if step_times.len() == 0 {
        info!("No steps were run");
        return Ok(());
    }

    info!(
        "Step time over all nodes: p50 {} us, p99 {} us, max {} us",
        step_times.value_at_quantile(0.5),
        step_times.value_at_quantile(0.99),
        step_times.max()
    );
    Ok(())
}
