//! Outbound collaborators
//!
//! The registry publishes through a [`TelemetrySink`] and records counters
//! through a [`MetricsRecorder`]. Both are injected at construction time;
//! every call the core makes is failure-isolated.

use async_trait::async_trait;
use tracing::info;

use crate::core::{Result, ScaleHealth};

/// Real-time publish and presence channel
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Publishes a changed weight display value
    async fn publish_weight(&self, scale_id: &str, value: &str) -> Result<()>;

    /// Publishes a full health snapshot
    async fn publish_status(&self, scale_id: &str, health: &ScaleHealth) -> Result<()>;

    /// Announces a scale as online
    async fn presence_enter(&self, health: &ScaleHealth) -> Result<()>;

    /// Refreshes presence data for an online scale
    async fn presence_update(&self, health: &ScaleHealth) -> Result<()>;

    /// Announces a scale as gone
    async fn presence_leave(&self, scale_id: &str) -> Result<()>;

    /// Tears the channel down; called once at registry shutdown
    async fn close(&self) -> Result<()>;
}

/// Fire-and-forget instrumentation
pub trait MetricsRecorder: Send + Sync {
    fn record_connection(&self, _scale_id: &str, _connected: bool) {}

    fn record_error(&self, _scale_id: &str, _kind: &'static str) {}

    fn record_reconnect(&self, _scale_id: &str, _attempt: u32) {}

    fn record_weight(&self, _scale_id: &str) {}

    fn record_publish(&self, _scale_id: &str, _ok: bool) {}

    fn record_links(&self, _total: usize, _connected: usize) {}
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {}

/// Sink that writes every publication to the tracing subscriber
#[derive(Debug, Clone, Default)]
pub struct LoggingSink {
    target: String,
}

impl LoggingSink {
    pub fn new(target: impl Into<String>) -> Self {
        LoggingSink {
            target: target.into(),
        }
    }
}

#[async_trait]
impl TelemetrySink for LoggingSink {
    async fn publish_weight(&self, scale_id: &str, value: &str) -> Result<()> {
        info!(channel = %self.target, scale_id, weight = value, "weight");
        Ok(())
    }

    async fn publish_status(&self, scale_id: &str, health: &ScaleHealth) -> Result<()> {
        info!(
            channel = %self.target,
            scale_id,
            connected = health.is_connected,
            errors = health.error_count,
            last_error = health.last_error.as_deref().unwrap_or(""),
            "status"
        );
        Ok(())
    }

    async fn presence_enter(&self, health: &ScaleHealth) -> Result<()> {
        info!(channel = %self.target, scale_id = %health.scale_id, "presence enter");
        Ok(())
    }

    async fn presence_update(&self, health: &ScaleHealth) -> Result<()> {
        info!(
            channel = %self.target,
            scale_id = %health.scale_id,
            connected = health.is_connected,
            "presence update"
        );
        Ok(())
    }

    async fn presence_leave(&self, scale_id: &str) -> Result<()> {
        info!(channel = %self.target, scale_id, "presence leave");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!(channel = %self.target, "telemetry channel closed");
        Ok(())
    }
}
