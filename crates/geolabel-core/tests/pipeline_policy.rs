//! Cache reuse policy, concurrency ceiling and failure isolation, driven by
//! an in-process lookup that counts its calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geolabel_core::{
    CacheEntry, CacheStore, EnrichError, EnrichResult, Lookup, LookupMode, LookupTarget,
    MemoryCache, Outcome, Pipeline, PipelineConfig, Record,
};
use serde_json::{json, Value};

#[derive(Default)]
struct CountingLookup {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl CountingLookup {
    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lookup for CountingLookup {
    fn mode(&self) -> LookupMode {
        LookupMode::Remote
    }

    fn target(&self, record: &Record) -> EnrichResult<LookupTarget> {
        Ok(LookupTarget::Local {
            address: record.str_field("server").unwrap_or_default().to_string(),
        })
    }

    async fn call(&self, target: &LookupTarget, _timeout: Duration) -> EnrichResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let LookupTarget::Local { address } = target else {
            unreachable!("counting lookup only builds local targets");
        };
        match address.as_str() {
            "panic" => panic!("lookup exploded"),
            "down" => Err(EnrichError::Network {
                message: "connection refused".into(),
            }),
            ip => Ok(json!({"ip": ip, "country": "NL", "city": "Amsterdam"})),
        }
    }
}

fn record(v: Value) -> Record {
    Record::try_from(v).unwrap()
}

fn cached_pipeline(
    lookup: Arc<CountingLookup>,
    store: Arc<MemoryCache>,
    ignore_failed: bool,
) -> Pipeline {
    Pipeline::builder(
        PipelineConfig::default()
            .with_cache(true)
            .with_ignore_failed(ignore_failed)
            .with_retries(0, Duration::ZERO),
    )
    .lookup(lookup)
    .cache(store)
    .build()
    .unwrap()
}

#[tokio::test]
async fn test_cached_success_skips_lookup() {
    let lookup = CountingLookup::with_delay(Duration::ZERO);
    let store = Arc::new(MemoryCache::default());
    let pipeline = cached_pipeline(lookup.clone(), store.clone(), true);

    let mut r = record(json!({"server": "1.2.3.4", "name": "old"}));
    store.set(
        &pipeline.cache_key(&r),
        CacheEntry::success(json!({"ip": "1.2.3.4", "country": "JP", "city": "Tokyo"})),
    );

    assert_eq!(pipeline.enrich(&mut r).await, Outcome::CacheHitSuccess);
    assert_eq!(lookup.calls(), 0);
    assert_eq!(r["name"], "JP Tokyo");
}

#[tokio::test]
async fn test_cached_failure_honored() {
    let lookup = CountingLookup::with_delay(Duration::ZERO);
    let store = Arc::new(MemoryCache::default());
    let pipeline = cached_pipeline(lookup.clone(), store.clone(), false);

    let original = record(json!({"server": "1.2.3.4", "name": "old"}));
    store.set(&pipeline.cache_key(&original), CacheEntry::failure());

    let mut r = original.clone();
    assert_eq!(pipeline.enrich(&mut r).await, Outcome::CacheHitFailure);
    assert_eq!(lookup.calls(), 0);
    assert_eq!(r, original);
}

#[tokio::test]
async fn test_cached_failure_ignored_retries_lookup() {
    let lookup = CountingLookup::with_delay(Duration::ZERO);
    let store = Arc::new(MemoryCache::default());
    let pipeline = cached_pipeline(lookup.clone(), store.clone(), true);

    let mut r = record(json!({"server": "1.2.3.4", "name": "old"}));
    let key = pipeline.cache_key(&r);
    store.set(&key, CacheEntry::failure());

    assert_eq!(pipeline.enrich(&mut r).await, Outcome::Success);
    assert_eq!(lookup.calls(), 1);
    assert_eq!(r["name"], "NL Amsterdam");
    assert!(!store.get(&key).unwrap().is_failure());
}

#[tokio::test]
async fn test_cache_disabled_neither_reads_nor_writes() {
    let lookup = CountingLookup::with_delay(Duration::ZERO);
    let store = Arc::new(MemoryCache::default());
    let pipeline = Pipeline::builder(PipelineConfig::default())
        .lookup(lookup.clone())
        .cache(store.clone())
        .build()
        .unwrap();

    let mut r = record(json!({"server": "1.2.3.4"}));
    store.set(&pipeline.cache_key(&r), CacheEntry::failure());

    assert_eq!(pipeline.enrich(&mut r).await, Outcome::Success);
    assert_eq!(lookup.calls(), 1);
    assert_eq!(store.get(&pipeline.cache_key(&r)), Some(CacheEntry::failure()));
}

#[tokio::test]
async fn test_concurrency_ceiling() {
    let lookup = CountingLookup::with_delay(Duration::from_millis(20));
    let pipeline = Pipeline::builder(PipelineConfig::default().with_concurrency(3))
        .lookup(lookup.clone())
        .build()
        .unwrap();

    let records = (0..20)
        .map(|i| record(json!({"server": format!("10.0.0.{i}")})))
        .collect();
    let out = pipeline.run(records).await;

    assert_eq!(out.report.success, 20);
    assert_eq!(lookup.calls(), 20);
    assert!(lookup.peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_one_record_failing_does_not_affect_others() {
    let lookup = CountingLookup::with_delay(Duration::from_millis(1));
    let pipeline = Pipeline::builder(
        PipelineConfig::default()
            .with_retries(0, Duration::ZERO)
            .with_concurrency(2),
    )
    .lookup(lookup.clone())
    .build()
    .unwrap();

    let out = pipeline
        .run(vec![
            record(json!({"server": "1.1.1.1", "name": "a"})),
            record(json!({"server": "panic", "name": "b"})),
            record(json!({"server": "down", "name": "c"})),
            record(json!({"server": "8.8.8.8", "name": "d"})),
        ])
        .await;

    assert_eq!(out.report.total, 4);
    assert_eq!(out.report.success, 2);
    assert_eq!(out.report.failure, 1);
    assert_eq!(out.report.panicked, 1);
    assert_eq!(out.records.len(), 4);
    assert_eq!(out.records[1]["name"], "b");
    assert_eq!(out.records[2]["name"], "c");
    assert_eq!(out.records[3]["name"], "NL Amsterdam");
}

#[tokio::test]
async fn test_panicked_task_writes_failure_entry() {
    let lookup = CountingLookup::with_delay(Duration::ZERO);
    let store = Arc::new(MemoryCache::default());
    let pipeline = cached_pipeline(lookup.clone(), store.clone(), false);

    let records = vec![
        record(json!({"server": "panic", "name": "b"})),
        record(json!({"server": "1.1.1.1", "name": "a"})),
    ];
    let panic_key = pipeline.cache_key(&records[0]);
    let out = pipeline.run(records).await;

    assert_eq!(out.report.panicked, 1);
    assert_eq!(out.report.success, 1);
    assert_eq!(store.get(&panic_key), Some(CacheEntry::failure()));
    assert_eq!(out.records[0]["name"], "b");

    // The failure entry is honored on the next run.
    let mut again = record(json!({"server": "panic", "name": "b"}));
    assert_eq!(pipeline.enrich(&mut again).await, Outcome::CacheHitFailure);
}

#[tokio::test]
async fn test_label_with_indexed_record_field() {
    let lookup = CountingLookup::with_delay(Duration::ZERO);
    let pipeline = Pipeline::builder(
        PipelineConfig::default().with_format("{{api.country}} {{record.tags[0]}}/{{record.tags[1]}}"),
    )
    .lookup(lookup)
    .build()
    .unwrap();

    let mut r = record(json!({"server": "10.0.0.1", "tags": ["edge", "v6"]}));
    assert_eq!(pipeline.enrich(&mut r).await, Outcome::Success);
    assert_eq!(r["name"], "NL edge/v6");

    let mut short = record(json!({"server": "10.0.0.2", "tags": ["edge"]}));
    assert_eq!(pipeline.enrich(&mut short).await, Outcome::Success);
    assert_eq!(short["name"], "NL edge/");
}
