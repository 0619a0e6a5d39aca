use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::core::{Error, Result};

/// Lifecycle of a single scale link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No socket, nothing scheduled
    Idle,
    /// Allocating and binding the local socket
    Binding,
    /// Probe sent, waiting for the device to answer
    AwaitingHandshake,
    /// Handshake confirmed, data flowing
    Connected,
    /// Socket torn down, a reconnect is scheduled
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Exponential backoff for link reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub base_delay: Duration,
    /// Growth per attempt
    pub factor: f64,
    /// Ceiling on the delay; retries never stop
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * factor^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }
}

/// Timing configuration for a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// How long to wait for the handshake reply
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub validation_timeout: Duration,
    /// Watchdog period
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub heartbeat_interval: Duration,
    /// Silence after which the link is declared dead
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub inactivity_timeout: Duration,
    /// Silence while streaming that is only logged
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub streaming_stall_threshold: Duration,
    /// Polling period of `get_weight`
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub weight_poll_interval: Duration,
    pub recv_buffer_size: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            validation_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(30),
            streaming_stall_threshold: Duration::from_secs(10),
            weight_poll_interval: Duration::from_millis(100),
            recv_buffer_size: crate::core::MAX_DATAGRAM_SIZE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl LinkSettings {
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("validation_timeout", self.validation_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("inactivity_timeout", self.inactivity_timeout),
            ("weight_poll_interval", self.weight_poll_interval),
            ("reconnect.base_delay", self.reconnect.base_delay),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::config(format!("{} must be greater than zero", name)));
        }
        if self.streaming_stall_threshold >= self.inactivity_timeout {
            return Err(Error::config(
                "streaming_stall_threshold must be below inactivity_timeout",
            ));
        }
        if self.reconnect.factor.is_nan() || self.reconnect.factor < 1.0 {
            return Err(Error::config("reconnect.factor must be at least 1.0"));
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(Error::config("reconnect.max_delay must not be below base_delay"));
        }
        if self.recv_buffer_size == 0 {
            return Err(Error::config("recv_buffer_size must be greater than zero"));
        }
        Ok(())
    }
}

/// Which link timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    ValidationExpired,
    Heartbeat,
    ReconnectDue,
}

/// Every timer a link owns, on the tokio clock.
///
/// Disarmed timers never fire. Pausing the tokio clock in tests drives
/// all of them deterministically.
#[derive(Debug, Default)]
pub struct LinkTimers {
    validation: Option<Instant>,
    heartbeat: Option<Interval>,
    reconnect: Option<Instant>,
}

impl LinkTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_validation(&mut self, timeout: Duration) {
        self.validation = Some(Instant::now() + timeout);
    }

    pub fn disarm_validation(&mut self) {
        self.validation = None;
    }

    /// First tick lands one full period from now
    pub fn start_heartbeat(&mut self, period: Duration) {
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
    }

    pub fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
    }

    pub fn schedule_reconnect(&mut self, delay: Duration) {
        self.reconnect = Some(Instant::now() + delay);
    }

    pub fn cancel_reconnect(&mut self) {
        self.reconnect = None;
    }

    pub fn cancel_all(&mut self) {
        self.validation = None;
        self.heartbeat = None;
        self.reconnect = None;
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_some()
    }

    pub fn validation_pending(&self) -> bool {
        self.validation.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.validation.is_none() && self.heartbeat.is_none() && self.reconnect.is_none()
    }

    /// Waits for the next armed timer. One-shot timers disarm themselves when
    /// they fire; the heartbeat keeps running. Pends forever when nothing is armed.
    pub async fn next(&mut self) -> TimerEvent {
        let validation = self.validation;
        let reconnect = self.reconnect;

        let fired = tokio::select! {
            _ = wait_until(validation) => TimerEvent::ValidationExpired,
            _ = tick(&mut self.heartbeat) => TimerEvent::Heartbeat,
            _ = wait_until(reconnect) => TimerEvent::ReconnectDue,
        };

        match fired {
            TimerEvent::ValidationExpired => self.validation = None,
            TimerEvent::ReconnectDue => self.reconnect = None,
            TimerEvent::Heartbeat => {}
        }
        fired
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => std::future::pending().await,
    }
}
