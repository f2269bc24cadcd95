use std::sync::Arc;

use anyhow::Context;
use geolabel_core::{CidrTable, LookupMode, Pipeline};
use tracing::info;

use super::records;
use crate::cli::args::EnrichArgs;
use crate::exit_codes::{ENRICH_FAILED, SUCCESS};

pub async fn run(args: EnrichArgs) -> anyhow::Result<i32> {
    let mut cfg = args.pipeline.resolve()?;
    cfg.cache |= args.cache;
    cfg.ignore_failed |= args.ignore_failed;
    cfg.keep_metadata |= args.keep_metadata;
    cfg.remove_failed |= args.remove_failed;

    let mut builder = Pipeline::builder(cfg.clone());

    if cfg.mode == LookupMode::Local {
        if let Some(path) = &args.geo_db {
            builder = builder.classifier(Arc::new(CidrTable::load(path)?));
        }
    }

    let store = if cfg.cache {
        let store = Arc::new(args.cache_file.open()?);
        builder = builder.cache(store.clone());
        Some(store)
    } else {
        None
    };

    let pipeline = builder.build().context("cannot start enrichment")?;
    let input = records::read(&args.input)?;
    info!(records = input.len(), input = %args.input.display(), "enriching");

    let output = pipeline.run(input).await;

    if let Some(store) = &store {
        store.flush()?;
    }
    records::write(args.output.as_deref(), &output.records)?;
    if let Some(path) = &args.report {
        let text = serde_json::to_string_pretty(&output.report)?;
        std::fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))?;
    }

    let report = output.report;
    eprintln!(
        "enriched {}/{} (cached {}), failed {}, removed {}",
        report.enriched(),
        report.total,
        report.cache_hit_success,
        report.failed(),
        report.removed
    );

    if args.strict && report.failed() > 0 {
        return Ok(ENRICH_FAILED);
    }
    Ok(SUCCESS)
}
