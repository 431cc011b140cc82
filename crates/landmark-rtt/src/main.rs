// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Landmark RTT client CLI
//!
//! Measures connection round-trip times to a list of landmarks through the
//! probe-core helper and writes one JSON result document per run.
//!
//! # Usage
//!
//! ```bash
//! # One probe per landmark, direct connections
//! landmark-rtt landmarks.csv --location 50.85,4.35
//!
//! # Five probes each, at most 200 connections in flight
//! landmark-rtt landmarks.csv --location-unknown -n 5 -p 200
//!
//! # Through a SOCKS5 proxy
//! landmark-rtt landmarks.csv --location-unknown \
//!     --socks5 198.51.100.4:1080 --proxy-location-unknown
//!
//! # Using configuration file
//! landmark-rtt landmarks.csv --config probe.toml
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use landmark_rtt::config::parse_coordinates;
use landmark_rtt::{
    choose_probe_order, distinct_hosts, load_landmarks, resolve_landmarks, FdLimits, Landmark,
    ProbeConfig, ProbeRunner, ProcessHelper, ProcessLimits, ResultDocument, ResultRecorder,
    RunSettings, RunSummary,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Landmark round-trip latency measurement
#[derive(Parser, Debug)]
#[command(name = "landmark-rtt")]
#[command(about = "Measure TCP round-trip times to geolocation landmarks")]
#[command(version)]
struct Args {
    /// Landmark list (CSV: host[,port])
    landmarks: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Milliseconds between connection attempts
    #[arg(long)]
    spacing: Option<u32>,

    /// Milliseconds before a connection attempt is abandoned
    #[arg(long)]
    timeout: Option<u32>,

    /// Probes per landmark
    #[arg(short, long)]
    n_probes: Option<u32>,

    /// Concurrent connection attempts (0 = as many as the fd limit allows)
    #[arg(short, long)]
    parallel: Option<u32>,

    /// Location of this machine (format: "LAT,LON")
    #[arg(long, value_parser = parse_coordinates, allow_hyphen_values = true)]
    location: Option<[f64; 2]>,

    /// Location of this machine is not known
    #[arg(long, conflicts_with = "location")]
    location_unknown: bool,

    /// Connect through a SOCKS5 proxy (format: "host:port")
    #[arg(long)]
    socks5: Option<String>,

    /// Location of the proxy (format: "LAT,LON")
    #[arg(long, value_parser = parse_coordinates, allow_hyphen_values = true)]
    proxy_location: Option<[f64; 2]>,

    /// Location of the proxy is not known
    #[arg(long, conflicts_with = "proxy_location")]
    proxy_location_unknown: bool,

    /// Directory holding probe-core-direct and probe-core-socks
    #[arg(long)]
    helper_dir: Option<PathBuf>,

    /// Directory for result documents
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "probe.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match args.command {
        Some(Commands::GenConfig { ref output }) => cmd_gen_config(output),
        Some(Commands::Validate { ref config }) => cmd_validate(config),
        None => run(&args),
    };

    if let Err(e) = result {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let Some(ref landmarks_path) = args.landmarks else {
        bail!("missing landmark list (usage: landmark-rtt <LANDMARKS> ...)");
    };

    let config = build_config(args)?;
    let hard_limit = ProcessLimits.hard_limit()?;
    config.validate(hard_limit)?;

    let landmarks = load_landmarks(landmarks_path)
        .with_context(|| format!("loading {}", landmarks_path.display()))?;

    let path = measure(&config, &landmarks)
        .with_context(|| format!("probing {}", landmarks_path.display()))?;
    println!("{}", path.display());
    Ok(())
}

/// Resolve, schedule, probe and record one batch. Returns the document path.
fn measure(config: &ProbeConfig, landmarks: &[Landmark]) -> landmark_rtt::Result<PathBuf> {
    let addrs = resolve_landmarks(landmarks)?;
    tracing::info!(
        "{} landmarks ({} distinct hosts), {} probe(s) each",
        landmarks.len(),
        distinct_hosts(&addrs),
        config.n_probes
    );

    let mut rng = fastrand::Rng::new();
    let work = choose_probe_order(&addrs, config.n_probes as usize, &mut rng);

    let helper = ProcessHelper::from_config(config)?;
    tracing::debug!("helper: {}", helper.program().display());

    let mut runner = ProbeRunner::new(helper, ProcessLimits, RunSettings::from_config(config));
    let outcome = runner.run(&work)?;
    if let Some(violation) = outcome.contract_violation {
        tracing::warn!("results may be unreliable: {}", violation);
    }
    if let Some(incomplete) = outcome.incomplete() {
        tracing::warn!("{} ({:.0}% done)", incomplete, incomplete.ratio() * 100.0);
    }

    let summary = RunSummary::from_config(config)?;
    let doc = ResultDocument {
        summary: &summary,
        results: &outcome.results,
        landmarks,
        timestamp: chrono::Utc::now(),
    };
    Ok(ResultRecorder::new(&config.output_dir).record(&doc)?)
}

fn build_config(args: &Args) -> anyhow::Result<ProbeConfig> {
    // Load from file if specified
    let mut config = match args.config {
        Some(ref path) => ProbeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProbeConfig::default(),
    };

    // Command line overrides
    if let Some(spacing) = args.spacing {
        config.spacing = spacing;
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(n) = args.n_probes {
        config.n_probes = n;
    }
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }
    if let Some(location) = args.location {
        config.location = Some(location);
        config.location_unknown = false;
    } else if args.location_unknown {
        config.location = None;
        config.location_unknown = true;
    }
    if let Some(ref proxy) = args.socks5 {
        config.proxy = Some(proxy.clone());
    }
    if let Some(location) = args.proxy_location {
        config.proxy_location = Some(location);
        config.proxy_location_unknown = false;
    } else if args.proxy_location_unknown {
        config.proxy_location = None;
        config.proxy_location_unknown = true;
    }
    if let Some(ref dir) = args.helper_dir {
        config.helper_dir = Some(dir.clone());
    }
    if let Some(ref dir) = args.output_dir {
        config.output_dir = dir.clone();
    }

    Ok(config)
}

fn cmd_gen_config(output: &Path) -> anyhow::Result<()> {
    let config = ProbeConfig {
        n_probes: 3,
        parallel: 200,
        location: Some([50.85, 4.35]),
        proxy: Some("198.51.100.4:1080".into()),
        proxy_location_unknown: true,
        ..ProbeConfig::default()
    };

    let toml_str = toml::to_string_pretty(&config)?;

    let content = format!(
        r#"# landmark-rtt configuration
# Generated by landmark-rtt gen-config
#
# spacing and timeout are in milliseconds; parallel = 0 means as many
# connections as the open file limit allows.

{}
"#,
        toml_str
    );

    std::fs::write(output, content).with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> anyhow::Result<()> {
    let config = ProbeConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate(ProcessLimits.hard_limit()?)?;

    println!("Configuration valid!");
    println!();
    println!("Spacing:  {} ms", config.spacing);
    println!("Timeout:  {} ms", config.timeout);
    println!("Probes:   {} per landmark", config.n_probes);
    if config.parallel == 0 {
        println!("Parallel: max");
    } else {
        println!("Parallel: {}", config.parallel);
    }
    println!("Route:    {:?}", config.proxy_setting()?);
    println!("Helper:   {}", config.helper_program()?.display());
    Ok(())
}
