use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use super::{HttpTarget, Lookup, LookupTarget};
use crate::config::{LookupMode, PipelineConfig};
use crate::error::{EnrichError, EnrichResult};
use crate::record::Record;
use crate::template::{Context, Template, TemplateError};

/// HTTP API lookup. URL and header values are templates over `record`.
#[derive(Debug, Clone)]
pub struct RemoteLookup {
    client: reqwest::Client,
    method: Method,
    url: Template,
    headers: Vec<(HeaderName, Template)>,
}

impl RemoteLookup {
    pub fn new(config: &PipelineConfig) -> EnrichResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("geolabel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EnrichError::config(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: reqwest::Client, config: &PipelineConfig) -> EnrichResult<Self> {
        let method = Method::from_bytes(config.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| EnrichError::config(format!("invalid HTTP method '{}'", config.method)))?;

        let headers = config
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| EnrichError::config(format!("invalid header name '{name}'")))?;
                Ok((name, Template::parse(value)))
            })
            .collect::<EnrichResult<Vec<_>>>()?;

        Ok(Self {
            client,
            method,
            url: Template::parse(&config.effective_api()),
            headers,
        })
    }
}

#[async_trait]
impl Lookup for RemoteLookup {
    fn mode(&self) -> LookupMode {
        LookupMode::Remote
    }

    fn target(&self, record: &Record) -> EnrichResult<LookupTarget> {
        let record = record.to_value();
        let ctx = Context::new()
            .bind("record", &record)
            .bind("proxy", &record);

        let headers = self
            .headers
            .iter()
            .map(|(name, value)| {
                let rendered = value.render(&ctx)?;
                if HeaderValue::from_str(&rendered).is_err() {
                    return Err(TemplateError::Eval {
                        expr: value.source().to_string(),
                        message: format!("header '{name}' rendered to an invalid value"),
                    }
                    .into());
                }
                Ok((name.as_str().to_string(), rendered))
            })
            .collect::<EnrichResult<Vec<_>>>()?;

        Ok(LookupTarget::Remote(HttpTarget {
            method: self.method.as_str().to_string(),
            url: self.url.render(&ctx)?,
            headers,
        }))
    }

    async fn call(&self, target: &LookupTarget, timeout: Duration) -> EnrichResult<Value> {
        let LookupTarget::Remote(http) = target else {
            return Err(EnrichError::Unsupported {
                message: "remote lookup received a local target".to_string(),
            });
        };

        let method = Method::from_bytes(http.method.as_bytes())
            .map_err(|_| EnrichError::config(format!("invalid HTTP method '{}'", http.method)))?;

        let mut request = self.client.request(method, &http.url).timeout(timeout);
        for (name, value) in &http.headers {
            let value = HeaderValue::from_str(value).map_err(|_| {
                EnrichError::config(format!("header '{name}' has an invalid value"))
            })?;
            request = request.header(name.as_str(), value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EnrichError::Timeout { timeout }
            } else {
                EnrichError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnrichError::Status {
                status: status.as_u16(),
                url: http.url.clone(),
            });
        }

        let body = response.text().await.map_err(|e| EnrichError::Network {
            message: format!("failed to read response body: {e}"),
        })?;

        Ok(parse_body(&body))
    }
}

/// JSON when it parses, otherwise the raw body as a string.
fn parse_body(body: &str) -> Value {
    match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => {
            debug!(len = body.len(), "response is not JSON, keeping body as string");
            Value::String(body.trim().to_string())
        }
    }
}
