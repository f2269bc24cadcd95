//! Pipeline configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EnrichError;

/// Where lookup results come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupMode {
    /// HTTP API.
    #[default]
    Remote,
    /// Local address table.
    Local,
}

impl LookupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for LookupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookupMode {
    type Err = EnrichError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "http" => Ok(Self::Remote),
            "local" | "internal" => Ok(Self::Local),
            other => Err(EnrichError::config(format!(
                "unknown lookup mode '{other}' (expected 'remote' or 'local')"
            ))),
        }
    }
}

pub const DEFAULT_REMOTE_API: &str = "http://ip-api.com/json/{{record.server}}?lang=zh-CN";
pub const DEFAULT_REMOTE_FORMAT: &str = "{{api.country}} {{api.city}}";
pub const DEFAULT_REMOTE_VALID: &str = "is_ip('{{api.ip || api.query}}')";
pub const DEFAULT_LOCAL_FORMAT: &str = "{{api.countryCode}} {{api.aso}} - {{record.name}}";
pub const DEFAULT_LOCAL_VALID: &str = "\"{{api.countryCode || api.aso}}\".length > 0";

/// Enrichment settings.
///
/// Signed counts are accepted so that out-of-range values from config files
/// are clamped rather than rejected: `concurrency` floors at 1, `retries` at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub concurrency: i64,
    pub method: String,
    pub timeout_ms: u64,
    pub retries: i64,
    pub retry_delay_ms: u64,

    /// Lookup URL template. `None` means the mode default.
    pub api: Option<String>,
    /// Request header templates.
    pub headers: BTreeMap<String, String>,
    /// Label template. `None` means the mode default.
    pub format: Option<String>,
    /// Validity predicate. `None` means the mode default.
    pub valid: Option<String>,

    /// Regex over record field names that feed the cache key.
    pub key_fields: String,
    pub address_field: String,
    pub label_field: String,
    pub metadata_field: String,

    pub cache: bool,
    pub ignore_failed: bool,
    pub keep_metadata: bool,
    pub remove_failed: bool,
    pub mode: LookupMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            method: "GET".to_string(),
            timeout_ms: 5000,
            retries: 1,
            retry_delay_ms: 1000,
            api: None,
            headers: BTreeMap::new(),
            format: None,
            valid: None,
            key_fields: "^server$".to_string(),
            address_field: "server".to_string(),
            label_field: "name".to_string(),
            metadata_field: "_geo".to_string(),
            cache: false,
            ignore_failed: false,
            keep_metadata: false,
            remove_failed: false,
            mode: LookupMode::Remote,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `GEOLABEL_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `GEOLABEL_*` environment variables on this configuration.
    /// Unparseable values are ignored.
    pub fn with_env(mut self) -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn parsed<T: FromStr>(name: &str) -> Option<T> {
            var(name).and_then(|v| v.parse().ok())
        }
        fn flag(name: &str) -> Option<bool> {
            var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        }

        if let Some(v) = parsed("GEOLABEL_CONCURRENCY") {
            self.concurrency = v;
        }
        if let Some(v) = var("GEOLABEL_METHOD") {
            self.method = v;
        }
        if let Some(v) = parsed("GEOLABEL_TIMEOUT_MS") {
            self.timeout_ms = v;
        }
        if let Some(v) = parsed("GEOLABEL_RETRIES") {
            self.retries = v;
        }
        if let Some(v) = parsed("GEOLABEL_RETRY_DELAY_MS") {
            self.retry_delay_ms = v;
        }
        if let Some(v) = var("GEOLABEL_API") {
            self.api = Some(v);
        }
        if let Some(v) = var("GEOLABEL_FORMAT") {
            self.format = Some(v);
        }
        if let Some(v) = var("GEOLABEL_VALID") {
            self.valid = Some(v);
        }
        if let Some(v) = var("GEOLABEL_KEY_FIELDS") {
            self.key_fields = v;
        }
        if let Some(v) = flag("GEOLABEL_CACHE") {
            self.cache = v;
        }
        if let Some(v) = flag("GEOLABEL_IGNORE_FAILED") {
            self.ignore_failed = v;
        }
        if let Some(v) = flag("GEOLABEL_KEEP_METADATA") {
            self.keep_metadata = v;
        }
        if let Some(v) = flag("GEOLABEL_REMOVE_FAILED") {
            self.remove_failed = v;
        }
        if let Some(v) = var("GEOLABEL_MODE").and_then(|v| v.parse().ok()) {
            self.mode = v;
        }
        self
    }

    pub fn with_concurrency(mut self, n: i64) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_mode(mut self, mode: LookupMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_api(mut self, api: impl Into<String>) -> Self {
        self.api = Some(api.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_valid(mut self, valid: impl Into<String>) -> Self {
        self.valid = Some(valid.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: i64, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn with_ignore_failed(mut self, ignore: bool) -> Self {
        self.ignore_failed = ignore;
        self
    }

    pub fn with_keep_metadata(mut self, keep: bool) -> Self {
        self.keep_metadata = keep;
        self
    }

    pub fn with_remove_failed(mut self, remove: bool) -> Self {
        self.remove_failed = remove;
        self
    }

    pub fn with_key_fields(mut self, pattern: impl Into<String>) -> Self {
        self.key_fields = pattern.into();
        self
    }

    /// Lookup URL template for the current mode. Local mode has no URL; its
    /// "api" is the address field, which still feeds the cache key.
    pub fn effective_api(&self) -> String {
        match (&self.api, self.mode) {
            (Some(api), _) => api.clone(),
            (None, LookupMode::Remote) => DEFAULT_REMOTE_API.to_string(),
            (None, LookupMode::Local) => format!("{{{{record.{}}}}}", self.address_field),
        }
    }

    pub fn effective_format(&self) -> &str {
        match (&self.format, self.mode) {
            (Some(format), _) => format,
            (None, LookupMode::Remote) => DEFAULT_REMOTE_FORMAT,
            (None, LookupMode::Local) => DEFAULT_LOCAL_FORMAT,
        }
    }

    pub fn effective_valid(&self) -> &str {
        match (&self.valid, self.mode) {
            (Some(valid), _) => valid,
            (None, LookupMode::Remote) => DEFAULT_REMOTE_VALID,
            (None, LookupMode::Local) => DEFAULT_LOCAL_VALID,
        }
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1) as usize
    }

    pub fn effective_retries(&self) -> u32 {
        self.retries.clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.concurrency, 10);
        assert_eq!(cfg.method, "GET");
        assert_eq!(cfg.timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.retries, 1);
        assert_eq!(cfg.retry_delay(), Duration::from_millis(1000));
        assert_eq!(cfg.key_fields, "^server$");
        assert_eq!(cfg.effective_api(), DEFAULT_REMOTE_API);
        assert!(!cfg.cache && !cfg.ignore_failed && !cfg.keep_metadata && !cfg.remove_failed);
    }

    #[test]
    fn test_mode_specific_defaults() {
        let local = PipelineConfig::default().with_mode(LookupMode::Local);
        assert_eq!(local.effective_format(), DEFAULT_LOCAL_FORMAT);
        assert_eq!(local.effective_valid(), DEFAULT_LOCAL_VALID);
        assert_eq!(local.effective_api(), "{{record.server}}");

        let custom = local.with_format("{{api.asn}}");
        assert_eq!(custom.effective_format(), "{{api.asn}}");
    }

    #[test]
    fn test_clamping() {
        let cfg = PipelineConfig::default()
            .with_concurrency(-3)
            .with_retries(-2, Duration::ZERO);
        assert_eq!(cfg.effective_concurrency(), 1);
        assert_eq!(cfg.effective_retries(), 0);
    }

    #[test]
    fn test_yaml_partial_config() {
        let cfg: PipelineConfig =
            serde_yaml::from_str("concurrency: 4\nmode: local\ncache: true\n").unwrap();
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.mode, LookupMode::Local);
        assert!(cfg.cache);
        assert_eq!(cfg.timeout_ms, 5000);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("LOCAL".parse::<LookupMode>().unwrap(), LookupMode::Local);
        assert_eq!("internal".parse::<LookupMode>().unwrap(), LookupMode::Local);
        assert!("mmdb".parse::<LookupMode>().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overlay() {
        std::env::set_var("GEOLABEL_CONCURRENCY", "3");
        std::env::set_var("GEOLABEL_CACHE", "true");
        std::env::set_var("GEOLABEL_MODE", "local");
        std::env::set_var("GEOLABEL_RETRIES", "not-a-number");

        let cfg = PipelineConfig::from_env();

        std::env::remove_var("GEOLABEL_CONCURRENCY");
        std::env::remove_var("GEOLABEL_CACHE");
        std::env::remove_var("GEOLABEL_MODE");
        std::env::remove_var("GEOLABEL_RETRIES");

        assert_eq!(cfg.concurrency, 3);
        assert!(cfg.cache);
        assert_eq!(cfg.mode, LookupMode::Local);
        assert_eq!(cfg.retries, 1);
    }
}
