//! Scale Bridge: UDP link engine for industrial weighing scales
//!
//! Each scale gets a [`ScaleLink`] that validates the device with a probe,
//! keeps it alive with a watchdog and reconnects with exponential backoff.
//! A [`DeviceRegistry`] owns the links, resolves their serial numbers,
//! de-duplicates weight readings and forwards them to a [`TelemetrySink`].
pub mod core;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod telemetry;
mod util;

#[cfg(test)]
mod test_support;

// Re-export commonly used items
pub use crate::core::{BridgeConfig, Error, Result, ScaleEndpointConfig, ScaleHealth, WeightReading};
pub use crate::network::{HttpIdentityResolver, IdentityResolver, LinkEvent, ScaleLink};
pub use crate::protocol::{ConnectionState, FrameDecoder, LinkSettings};
pub use crate::registry::{DeviceRegistry, RegistryConfig, RegistryEvent};
pub use crate::telemetry::{LoggingSink, MetricsRecorder, NoopMetrics, TelemetrySink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
