// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! check-xmpp - XMPP connectivity probe for Waddle Social.
//!
//! Runs a single stream negotiation against a server and prints the
//! measurements (or the failure) as JSON on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use xmpp_probe::{probe, ConnectionResult};

mod config;

/// check-xmpp - Probe XMPP stream negotiation and STARTTLS
#[derive(Parser, Debug)]
#[command(name = "check-xmpp")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// XMPP domain, used for the stream `to` attribute and TLS verification
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Address to connect to instead of the domain
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Port (default: 5222, or 5269 with --s2s)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Open a server-to-server stream
    #[arg(long)]
    pub s2s: bool,

    /// Only use IPv4 addresses
    #[arg(short = '4', long, conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Only use IPv6 addresses
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// Require STARTTLS and use it even when optional
    #[arg(short = 's', long)]
    pub starttls: bool,

    /// Accept any server certificate (testing only)
    #[arg(long)]
    pub no_check_certificates: bool,

    /// Do not report certificate expiry
    #[arg(long)]
    pub no_certificate_expiry: bool,

    /// Additional trusted CA certificates (PEM)
    #[arg(long, value_name = "FILE")]
    pub ca_file: Option<PathBuf>,

    /// Overall timeout in seconds (default: 10)
    #[arg(short = 't', long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Load settings from a TOML file; flags override file values
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("xmpp_probe={0},check_xmpp={0}", level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let probe_config = config::build(&cli)?;
    debug!(config = ?probe_config, "Starting probe");

    let result = ConnectionResult::from(probe(&probe_config).await);
    let output = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
    println!("{}", output);

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
