//! Multi-device orchestration
//!
//! [`DeviceRegistry`] owns every [`ScaleLink`](crate::network::ScaleLink),
//! remembers which scales should stream, de-duplicates weight publications
//! and samples health on a fixed interval.

mod dedup;
mod manager;

pub use self::dedup::WeightDeduplicator;
pub use self::manager::{DeviceRegistry, RegistryConfig, RegistryEvent};
