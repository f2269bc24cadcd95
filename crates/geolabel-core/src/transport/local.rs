use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Lookup, LookupTarget};
use crate::config::{LookupMode, PipelineConfig};
use crate::error::{EnrichError, EnrichResult};
use crate::record::Record;

/// What a local database knows about one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// ISO country code.
    pub country: Option<String>,
    /// Autonomous system organization.
    pub organization: Option<String>,
    pub asn: Option<u32>,
}

/// Local address database (country and AS organization by address).
pub trait AddressClassifier: Send + Sync {
    fn classify(&self, addr: IpAddr) -> Classification;
}

/// Resolves the record's address field against an [`AddressClassifier`].
///
/// Produces `{"countryCode", "aso", "asn"}`; unknown parts are empty
/// strings, which the default validity predicate rejects.
#[derive(Clone)]
pub struct LocalLookup {
    classifier: Arc<dyn AddressClassifier>,
    address_field: String,
}

impl LocalLookup {
    pub fn new(classifier: Arc<dyn AddressClassifier>, config: &PipelineConfig) -> Self {
        Self {
            classifier,
            address_field: config.address_field.clone(),
        }
    }
}

impl std::fmt::Debug for LocalLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLookup")
            .field("address_field", &self.address_field)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Lookup for LocalLookup {
    fn mode(&self) -> LookupMode {
        LookupMode::Local
    }

    fn target(&self, record: &Record) -> EnrichResult<LookupTarget> {
        match record.get(&self.address_field) {
            Some(Value::String(address)) => Ok(LookupTarget::Local {
                address: address.trim().to_string(),
            }),
            _ => Err(EnrichError::Local {
                address: String::new(),
                reason: format!("record has no '{}' address", self.address_field),
            }),
        }
    }

    async fn call(&self, target: &LookupTarget, _timeout: Duration) -> EnrichResult<Value> {
        let LookupTarget::Local { address } = target else {
            return Err(EnrichError::Unsupported {
                message: "local lookup received a remote target".to_string(),
            });
        };

        // Host names are not resolved here.
        let addr: IpAddr = address.parse().map_err(|_| EnrichError::Local {
            address: address.clone(),
            reason: "not an IP address".to_string(),
        })?;

        let found = self.classifier.classify(addr);
        Ok(json!({
            "countryCode": found.country.unwrap_or_default(),
            "aso": found.organization.unwrap_or_default(),
            "asn": found.asn.map(|n| n.to_string()).unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl AddressClassifier for Fixed {
        fn classify(&self, addr: IpAddr) -> Classification {
            if addr.is_loopback() {
                return Classification::default();
            }
            Classification {
                country: Some("JP".into()),
                organization: Some("Example Net".into()),
                asn: Some(64500),
            }
        }
    }

    fn lookup() -> LocalLookup {
        LocalLookup::new(Arc::new(Fixed), &PipelineConfig::default())
    }

    fn addr(a: &str) -> LookupTarget {
        LookupTarget::Local { address: a.into() }
    }

    #[tokio::test]
    async fn test_known_address() {
        let value = lookup().call(&addr("203.0.113.9"), Duration::ZERO).await.unwrap();
        assert_eq!(
            value,
            json!({"countryCode": "JP", "aso": "Example Net", "asn": "64500"})
        );
    }

    #[tokio::test]
    async fn test_unknown_address_yields_empty_fields() {
        let value = lookup().call(&addr("127.0.0.1"), Duration::ZERO).await.unwrap();
        assert_eq!(value, json!({"countryCode": "", "aso": "", "asn": ""}));
    }

    #[tokio::test]
    async fn test_hostname_is_rejected() {
        let err = lookup()
            .call(&addr("example.com"), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrichError::Local { .. }));
    }

    #[test]
    fn test_target_requires_address_field() {
        let record = Record::try_from(json!({"name": "no address"})).unwrap();
        assert!(lookup().target(&record).is_err());

        let record = Record::try_from(json!({"server": " 10.0.0.1 "})).unwrap();
        assert_eq!(lookup().target(&record).unwrap(), addr("10.0.0.1"));
    }
}
