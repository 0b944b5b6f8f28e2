//! vaultline-fuzz: seeded stress runs of the demo synthetic-asset protocol.
//!
//! Drives the in-memory asset manager with randomized minting, redemption,
//! transfer and self-close actors, reconciling the shadow state against live
//! queries along the way.
//!
//! # Usage
//!
//! ```bash
//! # Run one seed
//! vaultline-fuzz --seed 12345
//!
//! # Sweep 50 consecutive seeds with manual block mining
//! vaultline-fuzz --seed 1000 --runs 50 --mining manual
//!
//! # Run each seed twice and compare fingerprints
//! vaultline-fuzz --seed 7 --check-determinism
//!
//! # Machine-readable output, project config from a directory
//! vaultline-fuzz --config-dir ./fuzz --json
//! ```
//!
//! Exit code 1 when any run fails; a JSON report per failing seed is written
//! to `report.output_dir`.

#![allow(clippy::print_stdout)] // Human-readable progress goes to stdout

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use vaultline_sim::{FuzzReport, FuzzResult, FuzzRunner, MiningMode, VaultlineConfig, testkit};

// ============================================================================
// CLI Configuration
// ============================================================================

/// Deterministic stress runs of the demo synthetic-asset protocol.
#[derive(Debug, Parser)]
#[command(name = "vaultline-fuzz")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Seed of the first run (defaults to `run.seed` from config).
    #[arg(long)]
    seed: Option<u64>,

    /// Scheduler iterations per run (defaults to `run.iterations`).
    #[arg(long)]
    iterations: Option<u64>,

    /// Number of consecutive seeds to run.
    #[arg(long, default_value_t = 1)]
    runs: u64,

    /// Directory holding vaultline.toml / vaultline.local.toml.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Block production mode of the transaction intermediary.
    #[arg(long, value_enum)]
    mining: Option<MiningArg>,

    /// Run every seed twice and compare shadow hashes and timer logs.
    #[arg(long)]
    check_determinism: bool,

    /// Emit one JSON object per line instead of human-readable output.
    #[arg(long)]
    json: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MiningArg {
    Auto,
    Manual,
}

impl From<MiningArg> for MiningMode {
    fn from(arg: MiningArg) -> Self {
        match arg {
            MiningArg::Auto => MiningMode::Auto,
            MiningArg::Manual => MiningMode::Manual,
        }
    }
}

fn load_config(cli: &Cli) -> Result<VaultlineConfig> {
    let mut config = match &cli.config_dir {
        Some(dir) => {
            let mut config = VaultlineConfig::load_from_dir(dir)
                .with_context(|| format!("loading configuration from {}", dir.display()))?;
            config.resolve_paths(dir);
            config
        }
        None => VaultlineConfig::load().context("loading configuration")?,
    };

    if let Some(seed) = cli.seed {
        config.run.seed = seed;
    }
    if let Some(iterations) = cli.iterations {
        config.run.iterations = iterations;
    }
    if let Some(mining) = cli.mining {
        config.run.mining = mining.into();
    }
    if cli.check_determinism {
        config.run.check_determinism = true;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ============================================================================
// Output
// ============================================================================

/// Writes the failure report of one seed, returning its path.
fn write_report(dir: &Path, result: &FuzzResult) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating report directory {}", dir.display()))?;
    let path = dir.join(format!("seed-{}.json", result.seed()));
    let document = json!({
        "error": result.error().map(ToString::to_string),
        "error_kind": result.error().map(|e| e.kind().to_string()),
        "report": result.report(),
    });
    let contents = serde_json::to_string_pretty(&document).context("serializing report")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("writing report {}", path.display()))?;
    Ok(path)
}

fn print_diagnostics(report: &FuzzReport) {
    println!("  final time:        {}", report.final_time);
    println!("  underlying height: {}", report.underlying_height);
    println!("  events processed:  {}", report.events_processed);
    println!(
        "  units:             spawned={} finished={} exited={} cancelled={} failed={}",
        report.units.spawned,
        report.units.finished,
        report.units.exited_expected,
        report.units.cancelled,
        report.units.failed
    );
    println!(
        "  transactions:      submitted={} acknowledged={} reverted={}",
        report.transactions.submitted,
        report.transactions.acknowledged,
        report.transactions.reverted
    );
    for violation in report
        .periodic_violations
        .iter()
        .chain(&report.final_violations)
    {
        println!("  violation: {violation}");
    }
    for failure in &report.uncaught {
        println!("  uncaught:  {failure}");
    }
    if !report.wind_down_trace.is_empty() {
        println!("  wind-down: {:?}", report.wind_down_trace);
    }
    println!("  shadow hash: {}", report.shadow_hash);
}

fn summary(result: &FuzzResult, elapsed_ms: u128) -> serde_json::Value {
    let report = result.report();
    json!({
        "seed": report.seed,
        "status": if result.is_ok() { "passed" } else { "failed" },
        "error": result.error().map(ToString::to_string),
        "iterations": report.iterations,
        "actions": report.actions_spawned,
        "events": report.events_processed,
        "violations": report.periodic_violations.len() + report.final_violations.len(),
        "shadow_hash": report.shadow_hash,
        "elapsed_ms": elapsed_ms,
    })
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let first_seed = config.run.seed;

    if !cli.json {
        println!("vaultline-fuzz");
        println!("==============");
        println!("Starting seed: {first_seed}");
        println!("Runs: {}", cli.runs);
        println!("Iterations per run: {}", config.run.iterations);
        println!("Mining: {:?}", config.run.mining);
        println!();
    }

    let start = Instant::now();
    let mut failed_seeds = Vec::new();

    for offset in 0..cli.runs {
        let mut run_config = config.clone();
        run_config.run.seed = first_seed.wrapping_add(offset);
        let runner = FuzzRunner::new(run_config);

        let run_start = Instant::now();
        let result = runner.run(testkit::demo_simulation);
        let elapsed_ms = run_start.elapsed().as_millis();

        if cli.json {
            println!("{}", summary(&result, elapsed_ms));
        } else if result.is_ok() {
            let report = result.report();
            println!(
                "seed {}: ok ({} actions, {} events, {elapsed_ms} ms)",
                report.seed,
                report.actions_spawned.values().sum::<u64>(),
                report.events_processed
            );
        } else if let Some(error) = result.error() {
            println!("seed {}: FAILED: {error}", result.seed());
            print_diagnostics(result.report());
        }

        if !result.is_ok() {
            let path = write_report(&config.report.output_dir, &result)?;
            tracing::info!(seed = result.seed(), path = %path.display(), "wrote failure report");
            failed_seeds.push(result.seed());
        }
    }

    let elapsed = start.elapsed();
    if cli.json {
        println!(
            "{}",
            json!({
                "type": "done",
                "runs": cli.runs,
                "failed_seeds": failed_seeds,
                "elapsed_ms": elapsed.as_millis(),
            })
        );
    } else {
        println!();
        println!(
            "{} of {} run(s) passed in {:.2}s",
            cli.runs - failed_seeds.len() as u64,
            cli.runs,
            elapsed.as_secs_f64()
        );
        if !failed_seeds.is_empty() {
            println!("Failing seeds: {failed_seeds:?}");
        }
    }

    if !failed_seeds.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
