//! warden-sim: adversarial simulation for Warden candidate selection
//!
//! Deterministic for a given seed. Log verbosity follows `RUST_LOG`.
//!
//! # Usage
//!
//! ```bash
//! # Time both strategies at every scale (f = 10..=70)
//! warden-sim scale --seed 12345
//!
//! # A single scale step, machine-readable
//! warden-sim --json scale --scale 2 --seed 7
//!
//! # One liar in a four-replica view, end to end
//! warden-sim scenario --n 4 --f 1
//!
//! # Use an explicit configuration file
//! warden-sim --config ./warden.toml scenario --n 7 --f 2 --liars 2
//! ```

#![allow(clippy::print_stdout)] // CLI output goes to stdout

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use warden_config::WardenConfig;
use warden_monitor::instrumentation::METRICS;
use warden_sim::{ScaleReport, Scenario, ScenarioReport, run_scale};

// ============================================================================
// CLI Configuration
// ============================================================================

/// Adversarial simulation for Warden candidate selection.
#[derive(Parser)]
#[command(name = "warden-sim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to warden.toml layering and WARDEN_* env).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit one JSON object per report instead of a table.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Time the heuristic and exhaustive strategies on entangled graphs.
    Scale {
        /// Single scale step (f = 10 * scale); all of 1..=7 when omitted.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=7))]
        scale: Option<u32>,

        /// Seed for liar selection and entanglement.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Run liars against a full replica set over an in-memory order.
    Scenario {
        /// Number of replicas.
        #[arg(long, default_value_t = 4)]
        n: usize,

        /// Fault bound.
        #[arg(long, default_value_t = 1)]
        f: usize,

        /// Lying replicas, at most f.
        #[arg(long, default_value_t = 1)]
        liars: usize,

        /// Seed for liar and victim selection.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Scale { scale, seed } => {
            let scales = scale.map_or(1..=7, |s| s..=s);
            if !cli.json {
                print_scale_header();
            }
            for scale in scales {
                let report = run_scale(scale, seed, &config.graph)?;
                if cli.json {
                    print_json(&report)?;
                } else {
                    print_scale_row(&report);
                }
            }
        }
        Commands::Scenario { n, f, liars, seed } => {
            let report = Scenario::run(n, f, liars, seed, &config)?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_scenario(&report);
            }
        }
    }

    if cli.json {
        print_json(&METRICS.snapshot())?;
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<WardenConfig> {
    match path {
        Some(path) => WardenConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => WardenConfig::load(),
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_scale_header() {
    println!(
        "{:>5} {:>5} {:>4} {:>6} {:>5} | {:>10} {:>10} | {:>10} {:>10} {:>8}",
        "scale", "n", "f", "edges", "floor", "heur.size", "heur.us", "exh.size", "exh.us", "timeouts"
    );
}

fn print_scale_row(report: &ScaleReport) {
    let [heuristic, exhaustive] = report.runs.as_slice() else {
        return;
    };
    let exhaustive_size = if exhaustive.exhaustive_eligible {
        exhaustive.candidates.to_string()
    } else {
        format!("{} (h)", exhaustive.candidates)
    };
    println!(
        "{:>5} {:>5} {:>4} {:>6} {:>5} | {:>10} {:>10} | {:>10} {:>10} {:>8}",
        report.scale,
        report.n,
        report.f,
        report.edges,
        report.floor,
        heuristic.candidates,
        heuristic.elapsed_micros,
        exhaustive_size,
        exhaustive.elapsed_micros,
        exhaustive.timeouts,
    );
}

fn print_scenario(report: &ScenarioReport) {
    println!("view: n={} f={} seed={}", report.n, report.f, report.seed);
    for (liar, victim) in &report.accusations {
        println!("  {liar} accused {victim}");
    }
    println!("instances delivered: {}", report.instances);
    println!("suspicion edges:     {:?}", report.edges);
    println!("candidates:          {:?}", report.candidates);
    println!(
        "agreement:           {}",
        if report.agreed { "all replicas agree" } else { "DIVERGED" }
    );
}
