//! Batch orchestration.
//!
//! Per record: cache lookup, then (on a miss) transport, validation and
//! labelling, then the outcome is stored back. Records live in their own
//! slot for the duration of the batch and are reassembled in input order.

use std::sync::{Arc, Mutex, PoisonError};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::cache::{CacheDecision, CacheKey, CacheStore, KeySpec, MemoryCache, Memoizer};
use crate::config::{LookupMode, PipelineConfig};
use crate::error::{EnrichError, EnrichResult};
use crate::record::Record;
use crate::scheduler::WorkerPool;
use crate::template::{Context, Predicate, Template};
use crate::transport::{
    AddressClassifier, LocalLookup, Lookup, RemoteLookup, RetryPolicy, RetryingTransport,
};

/// Terminal state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Labelled from a cached success; no lookup made.
    CacheHitSuccess,
    /// Skipped because of a cached failure; record untouched.
    CacheHitFailure,
    /// Looked up, validated and labelled.
    Success,
    /// Lookup, validation or labelling failed; record untouched.
    Failure,
}

impl Outcome {
    pub fn is_enriched(&self) -> bool {
        matches!(self, Self::CacheHitSuccess | Self::Success)
    }
}

/// Per-batch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub cache_hit_success: usize,
    pub cache_hit_failure: usize,
    pub success: usize,
    pub failure: usize,
    /// Records dropped by `remove_failed`.
    pub removed: usize,
    /// Tasks that panicked. Their records are returned unmodified.
    pub panicked: usize,
}

impl BatchReport {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::CacheHitSuccess => self.cache_hit_success += 1,
            Outcome::CacheHitFailure => self.cache_hit_failure += 1,
            Outcome::Success => self.success += 1,
            Outcome::Failure => self.failure += 1,
        }
    }

    pub fn enriched(&self) -> usize {
        self.cache_hit_success + self.success
    }

    /// Records that ended without metadata.
    pub fn failed(&self) -> usize {
        self.cache_hit_failure + self.failure + self.panicked
    }
}

/// Result of [`Pipeline::run`].
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub records: Vec<Record>,
    pub report: BatchReport,
}

/// Changes to apply to a record after a successful lookup.
#[derive(Debug)]
struct Enrichment {
    label: String,
    metadata: Value,
}

/// Assembles a [`Pipeline`]. Collaborators are optional; `build` fills in
/// the defaults for the configured mode.
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    cache: Option<Arc<dyn CacheStore>>,
    lookup: Option<Arc<dyn Lookup>>,
    classifier: Option<Arc<dyn AddressClassifier>>,
    http_client: Option<reqwest::Client>,
}

impl PipelineBuilder {
    /// Store used when `config.cache` is set. Defaults to a [`MemoryCache`].
    pub fn cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Replace the mode's lookup entirely.
    pub fn lookup(mut self, lookup: Arc<dyn Lookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Address database for local mode.
    pub fn classifier(mut self, classifier: Arc<dyn AddressClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Validate configuration and select the lookup. Fails before any record
    /// is touched.
    pub fn build(self) -> EnrichResult<Pipeline> {
        let config = self.config;

        reqwest::Method::from_bytes(config.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| EnrichError::config(format!("invalid HTTP method '{}'", config.method)))?;
        let fields = Regex::new(&config.key_fields).map_err(|e| {
            EnrichError::config(format!("invalid key field pattern '{}': {e}", config.key_fields))
        })?;

        let lookup: Arc<dyn Lookup> = match (self.lookup, config.mode) {
            (Some(lookup), _) => lookup,
            (None, LookupMode::Remote) => Arc::new(match self.http_client {
                Some(client) => RemoteLookup::with_client(client, &config)?,
                None => RemoteLookup::new(&config)?,
            }),
            (None, LookupMode::Local) => match self.classifier {
                Some(classifier) => Arc::new(LocalLookup::new(classifier, &config)),
                None => {
                    return Err(EnrichError::Unsupported {
                        message: "local lookup requested but no address database is available"
                            .to_string(),
                    })
                }
            },
        };

        let store: Option<Arc<dyn CacheStore>> = match (config.cache, self.cache) {
            (false, _) => None,
            (true, Some(store)) => Some(store),
            (true, None) => Some(Arc::new(MemoryCache::default())),
        };

        let key_spec = KeySpec {
            api: config.effective_api(),
            format: config.effective_format().to_string(),
            mode: lookup.mode(),
            fields,
        };

        info!(
            mode = %lookup.mode(),
            concurrency = config.effective_concurrency(),
            cache = store.is_some(),
            "pipeline ready"
        );

        Ok(Pipeline {
            inner: Arc::new(Inner {
                format: Template::parse(config.effective_format()),
                valid: Predicate::new(config.effective_valid()),
                memo: Memoizer::new(store, config.ignore_failed),
                transport: RetryingTransport::new(lookup, RetryPolicy::from_config(&config)),
                pool: WorkerPool::new(config.effective_concurrency()),
                key_spec,
                config,
            }),
        })
    }
}

struct Inner {
    config: PipelineConfig,
    key_spec: KeySpec,
    format: Template,
    valid: Predicate,
    memo: Memoizer,
    transport: RetryingTransport,
    pool: WorkerPool,
}

/// The enrichment pipeline. Cheap to clone; clones share collaborators.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            ..PipelineBuilder::default()
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn cache_key(&self, record: &Record) -> CacheKey {
        CacheKey::compute(record, &self.inner.key_spec)
    }

    /// Enrich one record in place. Never fails: errors are logged and
    /// reported as [`Outcome::Failure`].
    pub async fn enrich(&self, record: &mut Record) -> Outcome {
        let (outcome, enrichment) = self.process(record.clone()).await;
        if let Some(enrichment) = enrichment {
            self.apply(record, enrichment);
        }
        outcome
    }

    /// Enrich a batch with bounded concurrency, then apply `remove_failed`
    /// and `keep_metadata`. Output keeps input order.
    pub async fn run(&self, records: Vec<Record>) -> BatchOutput {
        let total = records.len();
        let slots: Vec<Arc<Mutex<Record>>> = records
            .into_iter()
            .map(|r| Arc::new(Mutex::new(r)))
            .collect();

        let tasks: Vec<_> = slots
            .iter()
            .map(|slot| {
                let this = self.clone();
                let slot = Arc::clone(slot);
                move || async move { this.enrich_slot(&slot).await }
            })
            .collect();

        let outcomes = self.inner.pool.run(tasks).await;

        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        for (slot, outcome) in slots.iter().zip(&outcomes) {
            match outcome {
                Some(outcome) => report.count(*outcome),
                None => {
                    report.panicked += 1;
                    let config = &self.inner.config;
                    let record = lock(slot).clone();
                    let name = record
                        .display_name(&config.label_field, &config.address_field)
                        .to_string();
                    error!(record = %name, "enrichment task panicked");
                    if self.inner.memo.is_enabled() {
                        self.inner.memo.store_failure(&self.cache_key(&record));
                    }
                }
            }
        }

        let mut records: Vec<Record> = slots.into_iter().map(take_slot).collect();

        let metadata_field = self.inner.config.metadata_field.as_str();
        if self.inner.config.remove_failed {
            records.retain(|r| r.get(metadata_field).is_some_and(|v| !v.is_null()));
            report.removed = total - records.len();
        }
        if !self.inner.config.keep_metadata {
            for record in &mut records {
                record.shift_remove(metadata_field);
            }
        }

        info!(
            total = report.total,
            success = report.success,
            cached = report.cache_hit_success,
            cached_failures = report.cache_hit_failure,
            failed = report.failure,
            panicked = report.panicked,
            removed = report.removed,
            "batch complete"
        );

        BatchOutput { records, report }
    }

    async fn enrich_slot(&self, slot: &Mutex<Record>) -> Outcome {
        let snapshot = lock(slot).clone();
        let (outcome, enrichment) = self.process(snapshot).await;
        if let Some(enrichment) = enrichment {
            self.apply(&mut lock(slot), enrichment);
        }
        outcome
    }

    async fn process(&self, record: Record) -> (Outcome, Option<Enrichment>) {
        let inner = &*self.inner;
        let name = record
            .display_name(&inner.config.label_field, &inner.config.address_field)
            .to_string();
        let key = inner.memo.is_enabled().then(|| self.cache_key(&record));

        if let Some(key) = &key {
            match inner.memo.lookup(key) {
                CacheDecision::Hit(api) => {
                    return match self.label(&record, &api) {
                        Ok(label) => {
                            info!(record = %name, "using cached success");
                            (
                                Outcome::CacheHitSuccess,
                                Some(Enrichment {
                                    label,
                                    metadata: api,
                                }),
                            )
                        }
                        Err(e) => {
                            error!(record = %name, error = %e, "cannot label cached result");
                            inner.memo.store_failure(key);
                            (Outcome::Failure, None)
                        }
                    };
                }
                CacheDecision::HonoredFailure => {
                    info!(record = %name, "using cached failure");
                    return (Outcome::CacheHitFailure, None);
                }
                CacheDecision::Miss => {}
            }
        }

        match self.lookup(&record).await {
            Ok(enrichment) => {
                if let Some(key) = &key {
                    inner.memo.store_success(key, enrichment.metadata.clone());
                }
                (Outcome::Success, Some(enrichment))
            }
            Err(e) => {
                error!(record = %name, error = %e, "enrichment failed");
                if let Some(key) = &key {
                    inner.memo.store_failure(key);
                }
                (Outcome::Failure, None)
            }
        }
    }

    async fn lookup(&self, record: &Record) -> EnrichResult<Enrichment> {
        let inner = &*self.inner;
        let target = inner.transport.lookup().target(record)?;
        let api = inner.transport.invoke(&target).await?;

        let record_value = record.to_value();
        let ctx = context(&record_value, &api);
        if !inner.valid.check(&ctx) {
            return Err(EnrichError::InvalidResponse {
                message: format!("rejected by validity rule `{}`", inner.valid.source()),
            });
        }
        let label = inner.format.render(&ctx)?;
        Ok(Enrichment {
            label,
            metadata: api,
        })
    }

    fn label(&self, record: &Record, api: &Value) -> EnrichResult<String> {
        let record_value = record.to_value();
        Ok(self.inner.format.render(&context(&record_value, api))?)
    }

    fn apply(&self, record: &mut Record, enrichment: Enrichment) {
        let config = &self.inner.config;
        record.insert(config.label_field.clone(), Value::String(enrichment.label));
        record.insert(config.metadata_field.clone(), enrichment.metadata);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("mode", &self.inner.key_spec.mode)
            .field("memo", &self.inner.memo)
            .field("transport", &self.inner.transport)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// `record` (alias `proxy`) and `api`, in that fallback order.
fn context<'v>(record: &'v Value, api: &'v Value) -> Context<'v> {
    Context::new()
        .bind("record", record)
        .bind("proxy", record)
        .bind("api", api)
}

fn lock(slot: &Mutex<Record>) -> std::sync::MutexGuard<'_, Record> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_slot(slot: Arc<Mutex<Record>>) -> Record {
    match Arc::try_unwrap(slot) {
        Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
        Err(shared) => lock(&shared).clone(),
    }
}
