//! Core types and errors for the scale bridge
//!
//! This module contains the data model shared by the link engine and the registry.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    BridgeConfig,
    ScaleEndpointConfig,
    ScaleHealth,
    WeightReading,
};

/// Default UDP port scales listen on
pub const DEFAULT_DEVICE_PORT: u16 = 4001;

/// Receive buffer size for a single datagram
pub const MAX_DATAGRAM_SIZE: usize = 2048;
