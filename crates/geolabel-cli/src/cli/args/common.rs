//! Argument groups shared by several commands.

use std::path::PathBuf;

use clap::ValueEnum;
use geolabel_core::{LookupMode, PipelineConfig};

use crate::store::{FileCache, DEFAULT_TTL_MS};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum ModeArg {
    Remote,
    Local,
}

impl From<ModeArg> for LookupMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Remote => LookupMode::Remote,
            ModeArg::Local => LookupMode::Local,
        }
    }
}

/// Pipeline settings. Precedence: flag > environment > config file > default.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct PipelineArgs {
    /// YAML (or JSON) file with pipeline settings
    #[arg(long, short = 'c', env = "GEOLABEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Lookup mode
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Lookup URL template, e.g. http://ip-api.com/json/{{record.server}}
    #[arg(long)]
    pub api: Option<String>,

    /// HTTP method for remote lookups
    #[arg(long)]
    pub method: Option<String>,

    /// Extra request header as NAME=TEMPLATE (repeatable)
    #[arg(long = "header", value_name = "NAME=TEMPLATE")]
    pub headers: Vec<String>,

    /// Label template
    #[arg(long)]
    pub format: Option<String>,

    /// Validity predicate over the lookup response
    #[arg(long)]
    pub valid: Option<String>,

    /// Regex over record field names that feed the cache key
    #[arg(long)]
    pub key_fields: Option<String>,

    /// Maximum lookups in flight
    #[arg(long)]
    pub concurrency: Option<i64>,

    /// Per-attempt timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Retries after the first attempt
    #[arg(long, allow_hyphen_values = true)]
    pub retries: Option<i64>,

    /// Base retry delay in milliseconds (retry N waits N times this)
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,
}

impl PipelineArgs {
    pub fn resolve(&self) -> anyhow::Result<PipelineConfig> {
        use anyhow::Context;

        let base = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config {}", path.display()))?;
                serde_yaml::from_str::<PipelineConfig>(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };
        let mut cfg = base.with_env();

        if let Some(mode) = self.mode {
            cfg.mode = mode.into();
        }
        if let Some(v) = &self.api {
            cfg.api = Some(v.clone());
        }
        if let Some(v) = &self.method {
            cfg.method = v.clone();
        }
        for header in &self.headers {
            let (name, value) = header
                .split_once('=')
                .with_context(|| format!("header '{header}' must be NAME=TEMPLATE"))?;
            cfg.headers.insert(name.trim().to_string(), value.to_string());
        }
        if let Some(v) = &self.format {
            cfg.format = Some(v.clone());
        }
        if let Some(v) = &self.valid {
            cfg.valid = Some(v.clone());
        }
        if let Some(v) = &self.key_fields {
            cfg.key_fields = v.clone();
        }
        if let Some(v) = self.concurrency {
            cfg.concurrency = v;
        }
        if let Some(v) = self.timeout_ms {
            cfg.timeout_ms = v;
        }
        if let Some(v) = self.retries {
            cfg.retries = v;
        }
        if let Some(v) = self.retry_delay_ms {
            cfg.retry_delay_ms = v;
        }
        Ok(cfg)
    }
}

/// Location and lifetime of the persistent cache.
#[derive(clap::Args, Clone, Debug)]
pub struct CacheFileArgs {
    /// Cache file (default: user cache dir)
    #[arg(long, env = "GEOLABEL_CACHE_FILE")]
    pub cache_file: Option<PathBuf>,

    /// Entries older than this are ignored and evicted
    #[arg(long, default_value_t = DEFAULT_TTL_MS, env = "GEOLABEL_CACHE_TTL_MS")]
    pub cache_ttl_ms: u64,
}

impl CacheFileArgs {
    pub fn path(&self) -> PathBuf {
        self.cache_file.clone().unwrap_or_else(FileCache::default_path)
    }

    pub fn open(&self) -> anyhow::Result<FileCache> {
        FileCache::open(self.path(), std::time::Duration::from_millis(self.cache_ttl_ms))
    }
}
