use clap::{Parser, Subcommand};

pub mod cache;
pub mod common;
pub mod enrich;
pub use cache::*;
pub use common::*;
pub use enrich::*;

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "geolabel",
    version,
    about = "Label endpoint records with geo/organization data from an HTTP API or a local table"
)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "GEOLABEL_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Enrich a batch of records and write them back out
    Enrich(EnrichArgs),
    /// Print the cache key of every record (diagnostics)
    Key(KeyArgs),
    /// Inspect or clear the persistent cache
    Cache(CacheArgs),
    Version,
}
