//! CLI argument parsing for the callstat demo harness

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Fixed-width table through the log (default)
    Text,
    /// One JSON document per report on stdout
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "callstat")]
#[command(version)]
#[command(
    about = "Drive a synthetic workload through the call timing monitor",
    long_about = None
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Worker threads generating calls
    #[arg(short = 't', long, default_value = "4")]
    pub threads: usize,

    /// Distinct synthetic call sites
    #[arg(long, default_value = "64")]
    pub sites: usize,

    /// How long the workload runs
    #[arg(short = 'd', long, value_name = "SECS", default_value = "3")]
    pub duration_secs: u64,

    /// Seconds between periodic reports (overrides the config file)
    #[arg(long, value_name = "SECS")]
    pub report_interval_secs: Option<u64>,

    /// Rows per report (overrides the config file)
    #[arg(long, value_name = "N")]
    pub top: Option<usize>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Leave sites under the simulated game install out of reports
    #[arg(long)]
    pub exclude_builtin: bool,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}
