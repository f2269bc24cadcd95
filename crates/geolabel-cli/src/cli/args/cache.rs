use clap::Subcommand;

use super::CacheFileArgs;

#[derive(clap::Args, Clone, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub cmd: CacheSub,
}

#[derive(Subcommand, Clone, Debug)]
pub enum CacheSub {
    /// Entry counts (expired entries excluded)
    Stats(CacheFileArgs),
    /// Delete the cache file
    Clear(CacheFileArgs),
}
