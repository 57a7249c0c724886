mod aggregate;
mod channel;
mod collector;
mod config;
mod extract;
mod merge;
mod plan;
mod ssh;
mod store;
mod table;

use aggregate::{CancelFlag, CollectError, ResultAggregator};
use channel::ChannelSynchronizer;
use clap::Parser;
use collector::{Collector, RunError};
use config::HarvestConfig;
use merge::DatasetMerger;
use ssh::SshSession;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Run a fixed list of commands in a remote shell over SSH, pull values out
/// of their output, and append the results to a tabular dataset.
#[derive(Parser, Debug)]
#[command(name = "ssh-harvest", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "harvest.toml")]
    config: PathBuf,

    /// Remote host (overrides config and SSH_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Dataset path; .xlsx, .csv, .db, .sqlite or .sqlite3 (overrides config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Sheet label (overrides config)
    #[arg(long)]
    sheet: Option<String>,

    /// Default settle time per command in milliseconds (overrides config)
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Cancel the run if it has not finished after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Validate config and print resolved settings, don't connect
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (per-command byte counts, merge details)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Print an error and its causes to stderr.
fn report(err: &dyn std::error::Error) {
    eprintln!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

fn resolve_config(cli: &Cli) -> Result<HarvestConfig, config::ConfigError> {
    let mut config = HarvestConfig::load(&cli.config)?;
    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(host) = &cli.host {
        config.ssh.host = Some(host.clone());
    }
    if let Some(output) = &cli.output {
        config.output.path = output.clone();
    }
    if let Some(sheet) = &cli.sheet {
        config.output.sheet = sheet.clone();
    }
    if let Some(settle_ms) = cli.settle_ms {
        config.collect.settle_ms = settle_ms;
    }

    config.validate()?;
    Ok(config)
}

fn build_collector(config: &HarvestConfig) -> Result<Collector, Box<dyn std::error::Error>> {
    let extractor = config.extractor()?;
    let aggregator = ResultAggregator::new(
        ChannelSynchronizer::new(config.collect.max_read_bytes),
        extractor,
    );
    let store = store::store_for_path(&config.output.path)?;
    let merger = DatasetMerger::new(
        store,
        config.output.path.clone(),
        config.output.sheet.clone(),
    );
    let collector = Collector::new(
        config.plan(),
        config.output.headers.clone(),
        aggregator,
        merger,
    )?;
    Ok(collector)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            report(&e);
            return ExitCode::from(2);
        }
    };
    tracing::debug!(?config, "resolved configuration");

    if cli.dry_run {
        match serde_json::to_string_pretty(&config.summary()) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                report(&e);
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    let target = match config.ssh_target() {
        Ok(t) => t,
        Err(e) => {
            report(&e);
            return ExitCode::from(2);
        }
    };
    let collector = match build_collector(&config) {
        Ok(c) => c,
        Err(e) => {
            report(e.as_ref());
            return ExitCode::from(2);
        }
    };

    tracing::info!(
        addr = %target.addr(),
        commands = config.commands.len(),
        output = %config.output.path.display(),
        "starting collection"
    );

    let cancel = CancelFlag::new();
    let run_cancel = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        collector.run(|| SshSession::open(&target), &run_cancel)
    });

    let deadline = async {
        match cli.deadline_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    // The settle sleep cannot be interrupted; cancellation takes effect
    // before the next command or before the dataset is written.
    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                tracing::warn!("interrupt received, stopping after the current command");
                cancel.cancel();
            }
            _ = &mut deadline, if !cancel.is_cancelled() => {
                tracing::warn!(deadline_secs = ?cli.deadline_secs, "deadline reached, cancelling run");
                cancel.cancel();
            }
        }
    };

    match joined {
        Ok(Ok(summary)) => {
            println!(
                "Output written: {} ({} new rows, {} total)",
                summary.output.display(),
                summary.rows_collected,
                summary.rows_total
            );
            ExitCode::SUCCESS
        }
        Ok(Err(RunError::Collect(CollectError::Cancelled))) => {
            eprintln!("collection cancelled; dataset left unchanged");
            ExitCode::from(130)
        }
        Ok(Err(e)) => {
            report(&e);
            eprintln!("dataset left unchanged");
            ExitCode::FAILURE
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
