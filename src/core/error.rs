use std::io;
use thiserror::Error;

/// Error types for the scale bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bind, send or receive failure on a link socket
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device never answered the handshake probe
    #[error("Handshake validation timed out after {timeout_ms}ms")]
    ValidationTimeout { timeout_ms: u64 },

    /// The heartbeat watchdog saw no datagram for too long
    #[error("No data received for {elapsed_ms}ms")]
    InactivityTimeout { elapsed_ms: u64 },

    /// Malformed or ambiguous frame content
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command was issued while the link was not connected
    #[error("Scale {0} not connected")]
    NotConnected(String),

    /// No weight reading arrived within the requested window
    #[error("Timed out waiting for weight from scale {scale_id} after {timeout_ms}ms")]
    WeightTimeout { scale_id: String, timeout_ms: u64 },

    #[error("Identity resolution failed: {0}")]
    IdentityResolution(String),

    #[error("Scale {0} not found")]
    ScaleNotFound(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The link driver has shut down
    #[error("Link for scale {0} is closed")]
    LinkClosed(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new identity resolution error
    pub fn identity(msg: impl Into<String>) -> Self {
        Error::IdentityResolution(msg.into())
    }

    /// Creates a new telemetry error
    pub fn telemetry(msg: impl Into<String>) -> Self {
        Error::Telemetry(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Stable label for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::ValidationTimeout { .. } => "validation_timeout",
            Error::InactivityTimeout { .. } => "inactivity_timeout",
            Error::Protocol(_) => "protocol",
            Error::NotConnected(_) => "not_connected",
            Error::WeightTimeout { .. } => "weight_timeout",
            Error::IdentityResolution(_) => "identity",
            Error::ScaleNotFound(_) => "not_found",
            Error::Telemetry(_) => "telemetry",
            Error::Config(_) => "config",
            Error::LinkClosed(_) => "closed",
        }
    }

    /// Whether the link state machine recovers from this error on its own
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ValidationTimeout { .. } | Error::InactivityTimeout { .. }
        )
    }
}
