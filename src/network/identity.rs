use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{Error, Result};

/// Looks up the durable serial number of a device
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, address: IpAddr) -> Result<String>;
}

/// Configuration for the HTTP identity lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Port of the device's web interface
    pub http_port: u16,
    /// Path requested; the device answers it with a 401 challenge
    pub path: String,
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub timeout: Duration,
    /// Vendor prefix in front of the serial inside the realm
    pub realm_prefix: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            http_port: 80,
            path: "/".to_string(),
            timeout: Duration::from_secs(3),
            realm_prefix: "Scale_".to_string(),
        }
    }
}

/// Resolves serials from the realm of the device's HTTP auth challenge
#[derive(Debug, Clone)]
pub struct HttpIdentityResolver {
    client: reqwest::Client,
    config: IdentityConfig,
}

impl HttpIdentityResolver {
    pub fn new(config: IdentityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpIdentityResolver { client, config })
    }

    fn url_for(&self, address: IpAddr) -> String {
        let host = SocketAddr::new(address, self.config.http_port);
        if self.config.path.starts_with('/') {
            format!("http://{}{}", host, self.config.path)
        } else {
            format!("http://{}/{}", host, self.config.path)
        }
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, address: IpAddr) -> Result<String> {
        let url = self.url_for(address);
        debug!(%url, "requesting identity challenge");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::identity(format!("request to {} failed: {}", url, e)))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(Error::identity(format!(
                "expected 401 from {}, got {}",
                url,
                response.status()
            )));
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .ok_or_else(|| Error::identity("challenge carries no WWW-Authenticate header"))?
            .to_str()
            .map_err(|e| Error::identity(format!("unreadable challenge header: {}", e)))?;

        let realm = parse_realm(challenge)
            .ok_or_else(|| Error::identity(format!("no realm in challenge {:?}", challenge)))?;

        serial_from_realm(realm, &self.config.realm_prefix)
    }
}

/// Extracts the realm value from a `WWW-Authenticate` challenge
pub fn parse_realm(challenge: &str) -> Option<&str> {
    let lower = challenge.to_ascii_lowercase();
    let start = lower.find("realm=")? + "realm=".len();
    let rest = &challenge[start..];

    let realm = match rest.strip_prefix('"') {
        Some(quoted) => &quoted[..quoted.find('"')?],
        None => rest.split(|c: char| c == ',' || c.is_whitespace()).next()?,
    };
    Some(realm)
}

fn serial_from_realm(realm: &str, prefix: &str) -> Result<String> {
    let serial = realm
        .strip_prefix(prefix)
        .ok_or_else(|| Error::identity(format!("realm {:?} lacks prefix {:?}", realm, prefix)))?
        .trim();

    if serial.is_empty() {
        return Err(Error::identity(format!("realm {:?} carries no serial", realm)));
    }
    Ok(serial.to_string())
}
