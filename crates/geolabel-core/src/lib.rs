//! Geo/organization enrichment of endpoint records.
//!
//! A [`Pipeline`] takes a batch of [`Record`]s, looks each one up (remote
//! HTTP API or local address table) with bounded concurrency, validates the
//! response, derives a display label from a template, and memoizes outcomes
//! in an injected [`CacheStore`].
//!
//! ```no_run
//! use geolabel_core::{Pipeline, PipelineConfig, Record};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), geolabel_core::EnrichError> {
//! let pipeline = Pipeline::builder(PipelineConfig::default().with_cache(true)).build()?;
//! let records = vec![Record::try_from(json!({"server": "1.1.1.1", "name": "edge"}))?];
//! let output = pipeline.run(records).await;
//! println!("{} enriched", output.report.enriched());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod template;
pub mod transport;

pub use cache::{CacheDecision, CacheEntry, CacheKey, CacheStore, KeySpec, MemoryCache, Memoizer};
pub use config::{LookupMode, PipelineConfig};
pub use error::{EnrichError, EnrichResult};
pub use geo::CidrTable;
pub use pipeline::{BatchOutput, BatchReport, Outcome, Pipeline, PipelineBuilder};
pub use record::Record;
pub use scheduler::WorkerPool;
pub use template::{Context, Predicate, Template, TemplateError};
pub use transport::{
    AddressClassifier, Classification, HttpTarget, LocalLookup, Lookup, LookupTarget,
    RemoteLookup, RetryPolicy, RetryingTransport,
};
