use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::{Error, Result};
use crate::protocol::ConnectionState;
use crate::registry::RegistryConfig;

/// Where a scale lives on the network and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleEndpointConfig {
    /// Device IP address
    pub address: IpAddr,
    /// Preferred local bind port; an ephemeral port is used when it is busy
    #[serde(default)]
    pub local_port: u16,
    /// Device UDP port
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Logical id; the address is used until identity resolution replaces it
    #[serde(default)]
    pub id: Option<String>,
}

fn default_remote_port() -> u16 {
    super::DEFAULT_DEVICE_PORT
}

impl ScaleEndpointConfig {
    /// Creates an endpoint with no explicit logical id
    pub fn new(address: IpAddr, local_port: u16, remote_port: u16) -> Self {
        ScaleEndpointConfig {
            address,
            local_port,
            remote_port,
            id: None,
        }
    }

    /// Sets the logical id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The only source address whose datagrams the link accepts
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.remote_port)
    }

    /// Id used to register the link before identity resolution
    pub fn provisional_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.address.to_string())
    }
}

/// A single decoded weight frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightReading {
    /// Owning scale id at capture time
    pub scale_id: String,
    /// Frame text between the markers
    pub raw: String,
    /// Device address field of the frame
    pub address: String,
    /// Sequence/command field of the frame
    pub command: String,
    /// Parsed weight, empty when the frame carried none
    pub weight: String,
    /// Weight unit, empty when the frame carried none
    pub unit: String,
    #[serde(serialize_with = "super::serde::serialize_time")]
    #[serde(deserialize_with = "super::serde::deserialize_time")]
    pub captured_at: SystemTime,
}

impl WeightReading {
    /// Human readable value, `"<weight> <unit>"` or the bare weight
    pub fn display(&self) -> String {
        if self.unit.is_empty() {
            self.weight.clone()
        } else {
            format!("{} {}", self.weight, self.unit)
        }
    }
}

/// Health snapshot of one link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleHealth {
    pub scale_id: String,
    pub address: IpAddr,
    pub is_connected: bool,
    pub state: ConnectionState,
    pub streaming: bool,
    /// Last datagram of any kind from the device, handshake included
    #[serde(default)]
    #[serde(serialize_with = "super::serde::serialize_opt_time")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_time")]
    pub last_seen: Option<SystemTime>,
    /// Last protocol datagram handed to the decoder
    #[serde(default)]
    #[serde(serialize_with = "super::serde::serialize_opt_time")]
    #[serde(deserialize_with = "super::serde::deserialize_opt_time")]
    pub last_activity: Option<SystemTime>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub last_weight: Option<WeightReading>,
}

impl ScaleHealth {
    /// Fresh snapshot for a link that has not connected yet
    pub fn new(scale_id: impl Into<String>, address: IpAddr) -> Self {
        ScaleHealth {
            scale_id: scale_id.into(),
            address,
            is_connected: false,
            state: ConnectionState::Idle,
            streaming: false,
            last_seen: None,
            last_activity: None,
            error_count: 0,
            last_error: None,
            reconnect_attempts: 0,
            last_weight: None,
        }
    }

    /// Records a failure against this link
    pub fn record_error(&mut self, err: &Error) {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
    }
}

/// Top-level configuration: registry tuning plus the bootstrap device list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub registry: RegistryConfig,
    pub scales: Vec<ScaleEndpointConfig>,
}

impl BridgeConfig {
    /// Checks the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;

        let mut seen = HashSet::new();
        for scale in &self.scales {
            if scale.remote_port == 0 {
                return Err(Error::config(format!(
                    "Scale {} has no remote port",
                    scale.provisional_id()
                )));
            }
            if !seen.insert(scale.provisional_id()) {
                return Err(Error::config(format!(
                    "Duplicate scale id {}",
                    scale.provisional_id()
                )));
            }
        }
        Ok(())
    }
}
