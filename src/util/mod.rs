//! Utility module
//!
//! Small helpers shared by the link engine and the registry.

use std::time::Duration;

/// Whole milliseconds in a duration, saturating at `u64::MAX`
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
