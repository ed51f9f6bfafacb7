use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ServiceConfig;
use crate::logging::LogArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Hexadecimal (lowercase)
    Hex,
    /// Uppercase hexadecimal
    HexUpper,
    /// Raw binary bytes
    Raw,
    /// Base64 (standard, with padding)
    Base64,
    /// Base64 URL-safe (no padding)
    Base64url,
}

#[derive(Debug, Args)]
pub struct ServiceArgs {
    /// Force FIPS mode on or off instead of reading /proc/sys/crypto/fips_enabled
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub fips: Option<bool>,

    /// Algorithm name to instantiate per CPU
    #[arg(long)]
    pub algorithm: Option<String>,

    /// Number of possible CPUs (0 = detect)
    #[arg(long)]
    pub cpus: Option<usize>,

    /// Scratch page size in bytes (0 = system page size)
    #[arg(long = "page-size")]
    pub page_size: Option<usize>,

    /// Time slice in microseconds before a long read yields
    #[arg(long = "resched-quantum-us")]
    pub resched_quantum_us: Option<u64>,
}

impl ServiceArgs {
    /// Apply explicitly given flags on top of `cfg`.
    pub fn apply(&self, cfg: &mut ServiceConfig) {
        if let Some(v) = self.fips {
            cfg.fips = Some(v);
        }
        if let Some(ref v) = self.algorithm {
            cfg.algorithm = v.clone();
        }
        if let Some(v) = self.cpus {
            cfg.cpus = v;
        }
        if let Some(v) = self.page_size {
            cfg.page_size = v;
        }
        if let Some(v) = self.resched_quantum_us {
            cfg.resched_quantum_us = v;
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "pcpurand", about = "Per-CPU DRBG reader for the system random device")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Number of random bytes to read
    #[arg(short = 'n', long = "bytes", default_value_t = 32)]
    pub bytes: usize,

    /// Output format
    #[arg(short = 'f', long = "format", value_enum, default_value_t = OutputFormat::Hex)]
    pub format: OutputFormat,

    /// Write output to a file instead of stdout
    #[arg(short = 'o', long = "output-file")]
    pub output_file: Option<PathBuf>,

    /// Read as the blocking device does: reseed the generator first
    #[arg(long)]
    pub reseed: bool,

    /// Deliver into a lazily faulted paged buffer instead of a plain one
    #[arg(long)]
    pub paged: bool,

    /// Configuration file path (default: /etc/pcpurand.toml)
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub service: ServiceArgs,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Hammer the bulk reader from many threads and report throughput
    Bench(BenchArgs),
}

#[derive(Debug, Parser)]
pub struct BenchArgs {
    /// Concurrent reader threads (default: one per possible CPU)
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Seconds to run
    #[arg(short = 'd', long, default_value_t = 5)]
    pub duration: u64,

    /// Bytes per read call
    #[arg(short = 's', long = "read-size", default_value_t = 4096)]
    pub read_size: usize,

    /// Use reseeding reads
    #[arg(long)]
    pub reseed: bool,

    /// Configuration file path (default: /etc/pcpurand.toml)
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub service: ServiceArgs,

    #[command(flatten)]
    pub log: LogArgs,
}
