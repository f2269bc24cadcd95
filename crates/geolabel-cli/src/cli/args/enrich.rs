use std::path::PathBuf;

use super::{CacheFileArgs, PipelineArgs};

#[derive(clap::Args, Clone, Debug)]
pub struct EnrichArgs {
    /// Records: JSON array (or YAML list); `-` reads stdin
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    /// Where to write enriched records (default: stdout)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Write the batch report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// CIDR table for local mode (YAML/JSON)
    #[arg(long, env = "GEOLABEL_GEO_DB")]
    pub geo_db: Option<PathBuf>,

    /// Memoize lookups in the persistent cache
    #[arg(long)]
    pub cache: bool,

    #[command(flatten)]
    pub cache_file: CacheFileArgs,

    /// Re-attempt records whose previous lookup failed
    #[arg(long)]
    pub ignore_failed: bool,

    /// Keep the lookup response on each record
    #[arg(long)]
    pub keep_metadata: bool,

    /// Drop records that could not be enriched
    #[arg(long)]
    pub remove_failed: bool,

    /// Exit 1 when any record failed
    #[arg(long)]
    pub strict: bool,
}

#[derive(clap::Args, Clone, Debug)]
pub struct KeyArgs {
    /// Records: JSON array (or YAML list); `-` reads stdin
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}
