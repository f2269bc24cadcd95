//! CIDR table: a file-backed [`AddressClassifier`].
//!
//! ```yaml
//! networks:
//!   - cidr: 203.0.113.0/24
//!     country: JP
//!     organization: Example Net
//!     asn: 64500
//! ```
//!
//! JSON with the same shape also loads. Lookups pick the longest matching
//! prefix.

use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use serde::Deserialize;
use tracing::info;

use crate::error::{EnrichError, EnrichResult};
use crate::transport::{AddressClassifier, Classification};

#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(default)]
    networks: Vec<NetworkEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct NetworkEntry {
    cidr: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    organization: Option<String>,
    #[serde(default)]
    asn: Option<u32>,
}

#[derive(Debug, Clone)]
struct Network {
    net: IpNet,
    info: Classification,
}

#[derive(Debug, Clone, Default)]
pub struct CidrTable {
    networks: Vec<Network>,
}

impl CidrTable {
    pub fn load(path: impl AsRef<Path>) -> EnrichResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| EnrichError::Unsupported {
            message: format!("cannot read geo table {}: {e}", path.display()),
        })?;
        let table = Self::parse(&text)?;
        info!(path = %path.display(), networks = table.len(), "loaded geo table");
        Ok(table)
    }

    pub fn parse(text: &str) -> EnrichResult<Self> {
        let file: TableFile = serde_yaml::from_str(text)
            .map_err(|e| EnrichError::config(format!("invalid geo table: {e}")))?;

        let mut networks = file
            .networks
            .into_iter()
            .map(|entry| {
                let net = entry.cidr.trim().parse::<IpNet>().map_err(|e| {
                    EnrichError::config(format!("invalid CIDR '{}': {e}", entry.cidr))
                })?;
                Ok(Network {
                    net: net.trunc(),
                    info: Classification {
                        country: entry.country,
                        organization: entry.organization,
                        asn: entry.asn,
                    },
                })
            })
            .collect::<EnrichResult<Vec<_>>>()?;

        // Longest prefix first, so the first hit is the most specific.
        networks.sort_by(|a, b| b.net.prefix_len().cmp(&a.net.prefix_len()));
        Ok(Self { networks })
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl AddressClassifier for CidrTable {
    fn classify(&self, addr: IpAddr) -> Classification {
        self.networks
            .iter()
            .find(|n| n.net.contains(&addr))
            .map(|n| n.info.clone())
            .unwrap_or_default()
    }
}
