use anyhow::Context;
use geolabel_core::{CacheKey, KeySpec};
use regex::Regex;

use super::records;
use crate::cli::args::KeyArgs;
use crate::exit_codes::SUCCESS;

/// One `key<TAB>name` line per record, in input order.
pub fn run(args: KeyArgs) -> anyhow::Result<i32> {
    let cfg = args.pipeline.resolve()?;
    let spec = KeySpec {
        api: cfg.effective_api(),
        format: cfg.effective_format().to_string(),
        mode: cfg.mode,
        fields: Regex::new(&cfg.key_fields)
            .with_context(|| format!("invalid key field pattern '{}'", cfg.key_fields))?,
    };

    for record in records::read(&args.input)? {
        let key = CacheKey::compute(&record, &spec);
        println!(
            "{key}\t{}",
            record.display_name(&cfg.label_field, &cfg.address_field)
        );
    }
    Ok(SUCCESS)
}
