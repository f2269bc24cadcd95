use crate::cli::args::{CacheArgs, CacheSub};
use crate::exit_codes::SUCCESS;

pub fn run(args: CacheArgs) -> anyhow::Result<i32> {
    match args.cmd {
        CacheSub::Stats(file) => {
            let cache = file.open()?;
            let stats = cache.stats();
            println!("path:      {}", cache.path().display());
            println!("entries:   {}", stats.entries);
            println!("successes: {}", stats.successes);
            println!("failures:  {}", stats.failures);
        }
        CacheSub::Clear(file) => {
            let cache = file.open()?;
            let removed = cache.clear()?;
            println!("removed {removed} entries from {}", cache.path().display());
        }
    }
    Ok(SUCCESS)
}
