use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::WeightDeduplicator;
use crate::core::{Error, Result, ScaleEndpointConfig, ScaleHealth, WeightReading};
use crate::network::{IdentityConfig, IdentityResolver, LinkEvent, ScaleLink};
use crate::protocol::LinkSettings;
use crate::telemetry::{MetricsRecorder, TelemetrySink};
use crate::util::duration_to_millis;

/// Buffered registry events per subscriber
const EVENT_CAPACITY: usize = 64;

/// Configuration for the device registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Settings applied to every link
    pub link: LinkSettings,
    /// Used by callers building an [`HttpIdentityResolver`](crate::network::HttpIdentityResolver)
    pub identity: IdentityConfig,
    /// Period of the health sampling loop
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub health_interval: Duration,
    /// Period of background connect attempts after a failed first connect
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub retry_interval: Duration,
    /// Window given to `get_weight`
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub weight_timeout: Duration,
    /// When set, a failed connect during `initialize` is returned to the
    /// caller and the link is dropped. Otherwise, and always after
    /// bootstrap, the link stays registered and retries.
    pub propagate_initial_connect_failure: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            link: LinkSettings::default(),
            identity: IdentityConfig::default(),
            health_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            weight_timeout: Duration::from_secs(5),
            propagate_initial_connect_failure: false,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        if self.health_interval.is_zero() {
            return Err(Error::config("health_interval must be greater than zero"));
        }
        if self.retry_interval.is_zero() {
            return Err(Error::config("retry_interval must be greater than zero"));
        }
        if self.weight_timeout.is_zero() {
            return Err(Error::config("weight_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Notifications broadcast to registry subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// One snapshot per link, emitted by every health sample
    Health(Vec<ScaleHealth>),
    LinkAdded { scale_id: String },
    LinkRemoved { scale_id: String },
    /// A link moved from its provisional id to its resolved serial
    Rekeyed { from: String, to: String },
}

/// Id a link is currently announced under, if any. Every presence
/// enter and leave for the link happens while holding this lock.
type Presence = Arc<Mutex<Option<String>>>;

struct LinkEntry {
    link: ScaleLink,
    pump: JoinHandle<()>,
    presence: Presence,
}

#[derive(Default)]
struct RegistryState {
    links: HashMap<String, LinkEntry>,
    /// Scales that should stream whenever they are connected
    streaming: HashSet<String>,
    /// Background connect loops for links whose first connect failed
    retries: HashMap<String, JoinHandle<()>>,
}

struct Inner {
    config: RegistryConfig,
    sink: Arc<dyn TelemetrySink>,
    metrics: Arc<dyn MetricsRecorder>,
    resolver: Arc<dyn IdentityResolver>,
    state: Mutex<RegistryState>,
    dedup: Mutex<WeightDeduplicator>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<RegistryEvent>,
    shut_down: AtomicBool,
}

/// Owns every scale link, keyed by logical id
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

impl DeviceRegistry {
    /// Creates an empty registry; nothing runs until links are added
    pub fn new(
        config: RegistryConfig,
        sink: Arc<dyn TelemetrySink>,
        metrics: Arc<dyn MetricsRecorder>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        DeviceRegistry {
            inner: Arc::new(Inner {
                config,
                sink,
                metrics,
                resolver,
                state: Mutex::new(RegistryState::default()),
                dedup: Mutex::new(WeightDeduplicator::new()),
                health_task: Mutex::new(None),
                events,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Receives health samples and membership changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Adds the bootstrap device list in order, then starts the health loop.
    ///
    /// With `propagate_initial_connect_failure` set, the first scale that
    /// fails to connect is dropped and its error returned.
    pub async fn initialize(
        &self,
        endpoints: impl IntoIterator<Item = ScaleEndpointConfig>,
    ) -> Result<()> {
        let propagate = self.inner.config.propagate_initial_connect_failure;
        for endpoint in endpoints {
            self.register(endpoint, propagate).await?;
        }
        self.start_health_loop().await;
        info!(links = self.link_count().await, "registry initialized");
        Ok(())
    }

    /// Registers and connects a scale. Adding an id that is already
    /// registered is a no-op. A failed connect keeps the scale registered
    /// and retries it in the background.
    pub async fn add_link(&self, endpoint: ScaleEndpointConfig) -> Result<()> {
        self.register(endpoint, false).await
    }

    async fn register(&self, endpoint: ScaleEndpointConfig, propagate: bool) -> Result<()> {
        let key = endpoint.provisional_id();
        let link = {
            let mut state = self.inner.state.lock().await;
            if self.is_shut_down() {
                return Err(Error::config("registry is shut down"));
            }
            if state.links.contains_key(&key) {
                warn!(scale_id = %key, "scale already registered, ignoring");
                return Ok(());
            }

            let (link, events) = ScaleLink::spawn(
                endpoint,
                self.inner.config.link.clone(),
                self.inner.resolver.clone(),
                self.inner.metrics.clone(),
            );
            let presence = Presence::default();
            let pump = tokio::spawn(pump_events(
                Arc::downgrade(&self.inner),
                link.clone(),
                presence.clone(),
                events,
            ));
            state.links.insert(
                key.clone(),
                LinkEntry {
                    link: link.clone(),
                    pump,
                    presence,
                },
            );
            link
        };
        info!(scale_id = %key, remote = %link.endpoint().remote_addr(), "scale registered");
        self.emit(RegistryEvent::LinkAdded {
            scale_id: key.clone(),
        });

        match link.connect().await {
            Ok(()) => {
                self.adopt_identity(&key, &link).await;
                Ok(())
            }
            Err(e) if propagate => {
                warn!(scale_id = %key, error = %e, "initial connect failed");
                self.remove_link(&key).await;
                Err(e)
            }
            Err(e) => {
                warn!(
                    scale_id = %key,
                    error = %e,
                    retry_ms = duration_to_millis(self.inner.config.retry_interval),
                    "initial connect failed, retrying in background"
                );
                self.schedule_retry(key, link).await;
                Ok(())
            }
        }
    }

    /// Closes and forgets a scale; unknown ids are ignored
    pub async fn remove_link(&self, scale_id: &str) {
        let (entry, retry) = {
            let mut state = self.inner.state.lock().await;
            state.streaming.remove(scale_id);
            (state.links.remove(scale_id), state.retries.remove(scale_id))
        };
        if let Some(task) = retry {
            task.abort();
        }
        let Some(entry) = entry else {
            debug!(scale_id, "remove of unknown scale ignored");
            return;
        };

        entry.link.close().await;
        entry.pump.abort();
        self.inner.dedup.lock().await.forget(scale_id);

        let announced = entry.presence.lock().await.take();
        if let Some(id) = announced {
            let result = self.inner.sink.presence_leave(&id).await;
            self.report(&id, "presence_leave", result);
        }
        info!(scale_id, "scale removed");
        self.emit(RegistryEvent::LinkRemoved {
            scale_id: scale_id.to_string(),
        });
    }

    /// Starts streaming on one scale, or on every scale when `scale_id` is
    /// `None`. Fan-out never fails; per-link failures are logged.
    pub async fn start_streaming(&self, scale_id: Option<&str>) -> Result<()> {
        let Some(scale_id) = scale_id else {
            self.fan_out(true).await;
            return Ok(());
        };

        let link = {
            let mut state = self.inner.state.lock().await;
            let link = state
                .links
                .get(scale_id)
                .map(|entry| entry.link.clone())
                .ok_or_else(|| Error::ScaleNotFound(scale_id.to_string()))?;
            state.streaming.insert(scale_id.to_string());
            link
        };
        link.start_streaming().await
    }

    /// Counterpart of [`start_streaming`](Self::start_streaming)
    pub async fn stop_streaming(&self, scale_id: Option<&str>) -> Result<()> {
        let Some(scale_id) = scale_id else {
            self.fan_out(false).await;
            return Ok(());
        };

        let link = {
            let mut state = self.inner.state.lock().await;
            let link = state
                .links
                .get(scale_id)
                .map(|entry| entry.link.clone())
                .ok_or_else(|| Error::ScaleNotFound(scale_id.to_string()))?;
            state.streaming.remove(scale_id);
            link
        };
        link.stop_streaming().await
    }

    async fn fan_out(&self, start: bool) {
        let links: Vec<(String, ScaleLink)> = {
            let mut state = self.inner.state.lock().await;
            let links: Vec<_> = state
                .links
                .iter()
                .map(|(id, entry)| (id.clone(), entry.link.clone()))
                .collect();
            if start {
                state.streaming.extend(links.iter().map(|(id, _)| id.clone()));
            } else {
                state.streaming.clear();
            }
            links
        };

        let results = join_all(links.iter().map(|(_, link)| async move {
            if start {
                link.start_streaming().await
            } else {
                link.stop_streaming().await
            }
        }))
        .await;

        for ((scale_id, _), result) in links.iter().zip(results) {
            if let Err(e) = result {
                warn!(scale_id = %scale_id, start, error = %e, "streaming change failed");
            }
        }
    }

    /// Takes a single reading from the named scale
    pub async fn get_weight(&self, scale_id: &str) -> Result<WeightReading> {
        let link = self
            .link(scale_id)
            .await
            .ok_or_else(|| Error::ScaleNotFound(scale_id.to_string()))?;
        link.get_weight(self.inner.config.weight_timeout).await
    }

    /// Starts (or restarts) the periodic health sampling task
    pub async fn start_health_loop(&self) {
        let mut slot = self.inner.health_task.lock().await;
        if self.is_shut_down() {
            return;
        }

        let period = self.inner.config.health_interval;
        let registry = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                DeviceRegistry { inner }.sample_health().await;
            }
        });

        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Publishes status and presence for every link and broadcasts the
    /// aggregate. Sink failures are logged per link.
    pub async fn sample_health(&self) -> Vec<ScaleHealth> {
        let links = self.links_snapshot().await;
        let mut snapshots = Vec::with_capacity(links.len());

        for (scale_id, link) in links {
            let health = link.health();
            let result = self.inner.sink.publish_status(&scale_id, &health).await;
            self.report(&scale_id, "publish_status", result);
            let result = self.inner.sink.presence_update(&health).await;
            self.report(&scale_id, "presence_update", result);
            snapshots.push(health);
        }

        let connected = snapshots.iter().filter(|h| h.is_connected).count();
        self.inner.metrics.record_links(snapshots.len(), connected);
        debug!(links = snapshots.len(), connected, "health sampled");
        self.emit(RegistryEvent::Health(snapshots.clone()));
        snapshots
    }

    /// Stops everything in order: retry loops and the health loop first,
    /// then streaming, then the links, then presence and the sink.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("registry already shut down");
            return;
        }
        info!("registry shutting down");

        let retries: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock().await;
            state.retries.drain().map(|(_, task)| task).collect()
        };
        for task in &retries {
            task.abort();
        }
        if let Some(task) = self.inner.health_task.lock().await.take() {
            task.abort();
        }

        let entries: Vec<(String, LinkEntry)> = {
            let mut state = self.inner.state.lock().await;
            state.streaming.clear();
            state.links.drain().collect()
        };

        let streaming: Vec<&(String, LinkEntry)> = entries
            .iter()
            .filter(|(_, entry)| entry.link.health().streaming)
            .collect();
        let stops = join_all(streaming.iter().map(|(_, entry)| entry.link.stop_streaming())).await;
        for ((scale_id, _), result) in streaming.iter().zip(stops) {
            if let Err(e) = result {
                debug!(scale_id = %scale_id, error = %e, "stop on shutdown failed");
            }
        }

        join_all(entries.iter().map(|(_, entry)| entry.link.close())).await;
        for (_, entry) in &entries {
            entry.pump.abort();
        }

        for (scale_id, _) in &entries {
            let result = self.inner.sink.presence_leave(scale_id).await;
            self.report(scale_id, "presence_leave", result);
        }
        if let Err(e) = self.inner.sink.close().await {
            warn!(error = %e, "telemetry close failed");
        }

        self.inner.dedup.lock().await.clear();
        self.inner.metrics.record_links(0, 0);
        info!(links = entries.len(), "registry shut down");
    }

    /// Snapshot of every link, ordered by id
    pub async fn health(&self) -> Vec<ScaleHealth> {
        self.links_snapshot()
            .await
            .into_iter()
            .map(|(_, link)| link.health())
            .collect()
    }

    pub async fn health_of(&self, scale_id: &str) -> Option<ScaleHealth> {
        self.link(scale_id).await.map(|link| link.health())
    }

    pub async fn scale_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().await.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn link(&self, scale_id: &str) -> Option<ScaleLink> {
        let state = self.inner.state.lock().await;
        state.links.get(scale_id).map(|entry| entry.link.clone())
    }

    pub async fn link_count(&self) -> usize {
        self.inner.state.lock().await.links.len()
    }

    /// Links still waiting for their first successful connect
    pub async fn pending_retries(&self) -> usize {
        self.inner.state.lock().await.retries.len()
    }

    /// Whether streaming was requested for the scale
    pub async fn is_streaming_requested(&self, scale_id: &str) -> bool {
        self.inner.state.lock().await.streaming.contains(scale_id)
    }

    async fn links_snapshot(&self) -> Vec<(String, ScaleLink)> {
        let state = self.inner.state.lock().await;
        let mut links: Vec<(String, ScaleLink)> = state
            .links
            .iter()
            .map(|(id, entry)| (id.clone(), entry.link.clone()))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links
    }

    async fn schedule_retry(&self, key: String, link: ScaleLink) {
        let mut state = self.inner.state.lock().await;
        let registered = state
            .links
            .get(&key)
            .is_some_and(|entry| entry.link.same_link(&link));
        if self.is_shut_down() || !registered {
            return;
        }

        let task = tokio::spawn(retry_until_connected(
            Arc::downgrade(&self.inner),
            key.clone(),
            link,
            self.inner.config.retry_interval,
        ));
        if let Some(previous) = state.retries.insert(key, task) {
            previous.abort();
        }
    }

    /// Resolves the serial of a freshly connected link and moves its entry
    /// to that id
    async fn adopt_identity(&self, key: &str, link: &ScaleLink) {
        let resolved = link.lookup_scale_id().await;
        if resolved == key {
            return;
        }

        let presence = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.links.get(key).filter(|e| e.link.same_link(link)) else {
                return;
            };
            let presence = entry.presence.clone();
            if state.links.contains_key(&resolved) {
                warn!(
                    scale_id = %key,
                    %resolved,
                    "resolved id already registered, keeping provisional id"
                );
                return;
            }

            if let Some(entry) = state.links.remove(key) {
                state.links.insert(resolved.clone(), entry);
            }
            if state.streaming.remove(key) {
                state.streaming.insert(resolved.clone());
            }
            if let Some(task) = state.retries.remove(key) {
                state.retries.insert(resolved.clone(), task);
            }
            presence
        };

        // Renaming under the presence lock means the pump announces either
        // the old id before this point or the new id after it
        let mut announced = presence.lock().await;
        if let Err(e) = link.set_scale_id(resolved.clone()).await {
            debug!(scale_id = %key, error = %e, "could not apply resolved id");
        }
        self.inner.dedup.lock().await.forget(key);

        info!(from = %key, to = %resolved, "scale re-keyed");
        self.emit(RegistryEvent::Rekeyed {
            from: key.to_string(),
            to: resolved.clone(),
        });

        if announced.as_deref() == Some(key) {
            let result = self.inner.sink.presence_leave(key).await;
            self.report(key, "presence_leave", result);
            let result = self.inner.sink.presence_enter(&link.health()).await;
            self.report(&resolved, "presence_enter", result);
            *announced = Some(resolved);
        }
    }

    async fn on_link_event(&self, link: &ScaleLink, presence: &Presence, event: LinkEvent) {
        let scale_id = link.scale_id();
        match event {
            LinkEvent::Connected { .. } => {
                let scale_id = {
                    let mut announced = presence.lock().await;
                    let health = link.health();
                    let scale_id = health.scale_id.clone();
                    let result = self.inner.sink.publish_status(&scale_id, &health).await;
                    self.report(&scale_id, "publish_status", result);
                    let result = self.inner.sink.presence_enter(&health).await;
                    self.report(&scale_id, "presence_enter", result);
                    *announced = Some(scale_id.clone());
                    scale_id
                };

                let resume = self.inner.state.lock().await.streaming.contains(&scale_id);
                if resume {
                    info!(scale_id = %scale_id, "resuming streaming");
                    if let Err(e) = link.start_streaming().await {
                        warn!(scale_id = %scale_id, error = %e, "could not resume streaming");
                    }
                }
            }
            LinkEvent::Disconnected { reason, .. } => {
                info!(scale_id = %scale_id, %reason, "scale disconnected");
                let mut announced = presence.lock().await;
                let health = link.health();
                let result = self.inner.sink.publish_status(&scale_id, &health).await;
                self.report(&scale_id, "publish_status", result);
                if let Some(id) = announced.take() {
                    let result = self.inner.sink.presence_leave(&id).await;
                    self.report(&id, "presence_leave", result);
                }
            }
            LinkEvent::Weight(reading) => self.forward_weight(&scale_id, &reading).await,
            LinkEvent::Status { payload, .. } => {
                debug!(scale_id = %scale_id, %payload, "status reply");
            }
            LinkEvent::Error { error, .. } => {
                debug!(scale_id = %scale_id, error = %error, "link error");
            }
        }
    }

    async fn forward_weight(&self, scale_id: &str, reading: &WeightReading) {
        let value = reading.display();
        if !self.inner.dedup.lock().await.is_changed(scale_id, &value) {
            trace!(scale_id, weight = %value, "unchanged weight dropped");
            return;
        }

        let result = self.inner.sink.publish_weight(scale_id, &value).await;
        if self.report(scale_id, "publish_weight", result) {
            debug!(scale_id, weight = %value, "weight published");
            self.inner.dedup.lock().await.record(scale_id, value);
        }
    }

    /// Logs and counts a sink call; true when it succeeded
    fn report(&self, scale_id: &str, operation: &'static str, result: Result<()>) -> bool {
        match result {
            Ok(()) => {
                self.inner.metrics.record_publish(scale_id, true);
                true
            }
            Err(e) => {
                warn!(scale_id, operation, error = %e, "telemetry call failed");
                self.inner.metrics.record_publish(scale_id, false);
                false
            }
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

async fn pump_events(
    registry: Weak<Inner>,
    link: ScaleLink,
    presence: Presence,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        DeviceRegistry { inner }
            .on_link_event(&link, &presence, event)
            .await;
    }
}

async fn retry_until_connected(
    registry: Weak<Inner>,
    key: String,
    link: ScaleLink,
    period: Duration,
) {
    let mut attempt: u32 = 0;
    loop {
        sleep(period).await;
        attempt = attempt.saturating_add(1);
        match link.connect().await {
            Ok(()) => break,
            Err(Error::LinkClosed(_)) => return,
            Err(e) => debug!(scale_id = %key, attempt, error = %e, "background connect failed"),
        }
    }

    let Some(inner) = registry.upgrade() else {
        return;
    };
    info!(scale_id = %key, attempt, "background connect succeeded");
    let registry = DeviceRegistry { inner };
    registry.inner.state.lock().await.retries.remove(&key);
    registry.adopt_identity(&key, &link).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::protocol::{Command, ReconnectPolicy, STOP_STREAMING};
    use crate::telemetry::NoopMetrics;
    use crate::test_support::{
        wait_until, CountingMetrics, FakeBehavior, FakeScale, FixedIdentity, RecordingSink,
        SinkCall,
    };

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            link: LinkSettings {
                validation_timeout: Duration::from_millis(150),
                weight_poll_interval: Duration::from_millis(10),
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_millis(100),
                    factor: 2.0,
                    max_delay: Duration::from_secs(1),
                },
                ..LinkSettings::default()
            },
            health_interval: Duration::from_secs(60),
            retry_interval: Duration::from_millis(200),
            weight_timeout: Duration::from_secs(1),
            ..RegistryConfig::default()
        }
    }

    fn registry_with(
        config: RegistryConfig,
        sink: Arc<RecordingSink>,
        identity: FixedIdentity,
    ) -> DeviceRegistry {
        DeviceRegistry::new(config, sink, Arc::new(NoopMetrics), Arc::new(identity))
    }

    async fn wait_for_ids(registry: &DeviceRegistry, expected: &[&str]) {
        for _ in 0..100 {
            if registry.scale_ids().await == expected {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("registry ids never became {:?}", expected);
    }

    fn weight(scale_id: &str, display: &str) -> (String, String) {
        (scale_id.to_string(), display.to_string())
    }

    #[test]
    fn test_config_validation() {
        assert!(RegistryConfig::default().validate().is_ok());

        let mut config = RegistryConfig::default();
        config.retry_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = RegistryConfig::default();
        config.link.inactivity_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_partial_input() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{"health_interval": 2.5, "propagate_initial_connect_failure": true}"#,
        )
        .unwrap();
        assert_eq!(config.health_interval, Duration::from_millis(2500));
        assert!(config.propagate_initial_connect_failure);
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.link, LinkSettings::default());
    }

    #[tokio::test]
    async fn test_add_link_connects_and_announces() {
        let fake = FakeScale::start(FakeBehavior::answering()).await;
        let sink = RecordingSink::new();
        let registry = registry_with(fast_config(), sink.clone(), FixedIdentity::failing());

        registry.add_link(fake.endpoint()).await.unwrap();
        assert_eq!(registry.scale_ids().await, vec!["127.0.0.1"]);
        assert!(registry.health_of("127.0.0.1").await.unwrap().is_connected);

        wait_until(|| sink.count(&SinkCall::Enter("127.0.0.1".into())) == 1).await;
        assert_eq!(sink.count(&SinkCall::Status("127.0.0.1".into())), 1);

        // Second add of the same id is ignored
        registry.add_link(fake.endpoint()).await.unwrap();
        assert_eq!(registry.link_count().await, 1);
        assert_eq!(fake.count(Command::StopStreaming), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_rekeys_link() {
        let fake = FakeScale::start(FakeBehavior::answering()).await;
        let registry = registry_with(
            fast_config(),
            RecordingSink::new(),
            FixedIdentity::serial("SN0042"),
        );
        let mut events = registry.subscribe();

        registry.add_link(fake.endpoint()).await.unwrap();
        assert_eq!(registry.scale_ids().await, vec!["SN0042"]);
        assert_eq!(registry.link("SN0042").await.unwrap().scale_id(), "SN0042");

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::LinkAdded {
                scale_id: "127.0.0.1".into(),
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Rekeyed {
                from: "127.0.0.1".into(),
                to: "SN0042".into(),
            }
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_rekey_with_slow_sink_leaves_no_stale_presence() {
        let fake = FakeScale::start(FakeBehavior::answering()).await;
        let sink = RecordingSink::new();
        sink.delay_status(Duration::from_millis(100));
        let registry = registry_with(fast_config(), sink.clone(), FixedIdentity::serial("SN1"));

        registry.add_link(fake.endpoint()).await.unwrap();
        wait_until(|| sink.roster().contains("SN1")).await;
        sleep(Duration::from_millis(300)).await;

        assert_eq!(sink.roster(), BTreeSet::from(["SN1".to_string()]));
        assert_eq!(sink.count(&SinkCall::Enter("SN1".into())), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_rekey_collision_keeps_provisional_id() {
        let first = FakeScale::start(FakeBehavior::answering()).await;
        let second = FakeScale::start(FakeBehavior::answering()).await;
        let registry = registry_with(
            fast_config(),
            RecordingSink::new(),
            FixedIdentity::serial("SN1"),
        );

        registry.add_link(first.endpoint().with_id("a")).await.unwrap();
        registry.add_link(second.endpoint().with_id("b")).await.unwrap();

        assert_eq!(registry.scale_ids().await, vec!["SN1", "b"]);
        assert_eq!(registry.link("b").await.unwrap().scale_id(), "b");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_weights_publish_once() {
        let fake = FakeScale::start(FakeBehavior::streaming(&[
            "0100r01071AW   1.000kg",
            "0100r01071AW   1.000kgT   0.000kgS01561",
            "0100r01071AW   2.000kg",
        ]))
        .await;
        let sink = RecordingSink::new();
        let registry = registry_with(fast_config(), sink.clone(), FixedIdentity::failing());
        registry.add_link(fake.endpoint()).await.unwrap();

        registry.start_streaming(Some("127.0.0.1")).await.unwrap();
        assert!(registry.is_streaming_requested("127.0.0.1").await);

        wait_until(|| sink.weights().len() == 2).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            sink.weights(),
            vec![weight("127.0.0.1", "1.000 kg"), weight("127.0.0.1", "2.000 kg")]
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_by_next_reading() {
        let fake = FakeScale::start(FakeBehavior::streaming(&[
            "0100r01071AW   1.000kg",
            "0100r01071AW   1.000kg",
        ]))
        .await;
        let sink = RecordingSink::new();
        let metrics = CountingMetrics::new();
        let registry = DeviceRegistry::new(
            fast_config(),
            sink.clone(),
            metrics.clone(),
            Arc::new(FixedIdentity::failing()),
        );
        registry.add_link(fake.endpoint()).await.unwrap();

        sink.fail_next_weights(1);
        registry.start_streaming(Some("127.0.0.1")).await.unwrap();

        wait_until(|| sink.weights().len() == 1).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.weights(), vec![weight("127.0.0.1", "1.000 kg")]);
        assert_eq!(CountingMetrics::get(&metrics.failed_publishes), 1);
        assert_eq!(CountingMetrics::get(&metrics.weights), 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_scale() {
        let registry = registry_with(fast_config(), RecordingSink::new(), FixedIdentity::failing());

        registry.remove_link("missing").await;

        let err = registry.start_streaming(Some("missing")).await.unwrap_err();
        assert_eq!(err.to_string(), "Scale missing not found");
        assert_eq!(
            registry.stop_streaming(Some("missing")).await,
            Err(Error::ScaleNotFound("missing".into()))
        );
        assert!(matches!(registry.get_weight("missing").await, Err(Error::ScaleNotFound(_))));
        assert!(registry.health_of("missing").await.is_none());
        assert!(!registry.is_streaming_requested("missing").await);
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let good = FakeScale::start(FakeBehavior::answering()).await;
        let dead = FakeScale::start(FakeBehavior::silent()).await;
        let registry = registry_with(fast_config(), RecordingSink::new(), FixedIdentity::failing());

        registry.add_link(good.endpoint().with_id("good")).await.unwrap();
        registry.add_link(dead.endpoint().with_id("dead")).await.unwrap();
        assert_eq!(registry.link_count().await, 2);

        registry.start_streaming(None).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(good.count(Command::StartStreaming), 1);
        assert_eq!(dead.count(Command::StartStreaming), 0);
        assert!(registry.is_streaming_requested("good").await);
        assert!(registry.is_streaming_requested("dead").await);

        registry.stop_streaming(None).await.unwrap();
        assert!(!registry.is_streaming_requested("good").await);
        assert!(!registry.is_streaming_requested("dead").await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_initial_failure_propagates_when_configured() {
        let dead = FakeScale::start(FakeBehavior::silent()).await;
        let mut config = fast_config();
        config.propagate_initial_connect_failure = true;
        let registry = registry_with(config, RecordingSink::new(), FixedIdentity::failing());

        let err = registry.initialize(vec![dead.endpoint()]).await.unwrap_err();
        assert_eq!(err, Error::ValidationTimeout { timeout_ms: 150 });
        assert_eq!(registry.link_count().await, 0);
        assert_eq!(registry.pending_retries().await, 0);
    }

    #[tokio::test]
    async fn test_failure_after_bootstrap_keeps_link() {
        let good = FakeScale::start(FakeBehavior::answering()).await;
        let dead = FakeScale::start(FakeBehavior::silent()).await;
        let mut config = fast_config();
        config.propagate_initial_connect_failure = true;
        let registry = registry_with(config, RecordingSink::new(), FixedIdentity::failing());

        registry
            .initialize(vec![good.endpoint().with_id("a")])
            .await
            .unwrap();
        registry.add_link(dead.endpoint().with_id("b")).await.unwrap();

        assert_eq!(registry.scale_ids().await, vec!["a", "b"]);
        assert_eq!(registry.pending_retries().await, 1);
        assert!(!registry.health_of("b").await.unwrap().is_connected);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_retry_connects_and_rekeys() {
        let fake = FakeScale::start(FakeBehavior::silent()).await;
        let mut config = fast_config();
        config.link.reconnect.base_delay = Duration::from_secs(5);
        config.link.reconnect.max_delay = Duration::from_secs(10);
        let registry = registry_with(config, RecordingSink::new(), FixedIdentity::serial("SN0099"));

        registry.add_link(fake.endpoint()).await.unwrap();
        assert_eq!(registry.link_count().await, 1);
        assert_eq!(registry.pending_retries().await, 1);
        assert!(!registry.health_of("127.0.0.1").await.unwrap().is_connected);

        fake.set_behavior(FakeBehavior::answering());
        wait_for_ids(&registry, &["SN0099"]).await;
        assert_eq!(registry.pending_retries().await, 0);
        assert!(registry.health_of("SN0099").await.unwrap().is_connected);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_streaming_resumes_after_reconnect() {
        let fake = FakeScale::start(FakeBehavior::streaming(&["0100r01071AW   3.000kg"])).await;
        let sink = RecordingSink::new();
        let mut config = fast_config();
        config.link.heartbeat_interval = Duration::from_millis(50);
        config.link.inactivity_timeout = Duration::from_millis(300);
        config.link.streaming_stall_threshold = Duration::from_millis(150);
        let registry = registry_with(config, sink.clone(), FixedIdentity::failing());

        registry.add_link(fake.endpoint()).await.unwrap();
        registry.start_streaming(Some("127.0.0.1")).await.unwrap();

        // The fake goes quiet after one frame, so the link times out,
        // reconnects and the registry asks for streaming again
        wait_until(|| fake.count(Command::StartStreaming) == 2).await;
        assert!(sink.count(&SinkCall::Leave("127.0.0.1".into())) >= 1);
        assert!(sink.count(&SinkCall::Enter("127.0.0.1".into())) >= 2);
        assert_eq!(sink.weights(), vec![weight("127.0.0.1", "3.000 kg")]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_sampling_covers_every_link() {
        let good = FakeScale::start(FakeBehavior::answering()).await;
        let dead = FakeScale::start(FakeBehavior::silent()).await;
        let sink = RecordingSink::new();
        let registry = registry_with(fast_config(), sink.clone(), FixedIdentity::failing());
        registry.add_link(good.endpoint().with_id("a")).await.unwrap();
        registry.add_link(dead.endpoint().with_id("b")).await.unwrap();

        let mut events = registry.subscribe();
        let snapshots = registry.sample_health().await;
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].is_connected);
        assert!(!snapshots[1].is_connected);
        assert!(snapshots[1].last_error.is_some());

        assert_eq!(sink.count(&SinkCall::Update("a".into())), 1);
        assert_eq!(sink.count(&SinkCall::Update("b".into())), 1);
        match events.recv().await.unwrap() {
            RegistryEvent::Health(list) => assert_eq!(list, snapshots),
            other => panic!("unexpected event {:?}", other),
        }
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_loop_runs_on_interval() {
        let fake = FakeScale::start(FakeBehavior::answering()).await;
        let sink = RecordingSink::new();
        let mut config = fast_config();
        config.health_interval = Duration::from_millis(100);
        let registry = registry_with(config, sink.clone(), FixedIdentity::failing());

        registry.initialize(vec![fake.endpoint()]).await.unwrap();
        wait_until(|| sink.count(&SinkCall::Update("127.0.0.1".into())) >= 2).await;
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_weight_delegates_to_link() {
        let fake = FakeScale::start(FakeBehavior::streaming(&["0100r01071AW   4.500kg"])).await;
        let registry = registry_with(fast_config(), RecordingSink::new(), FixedIdentity::failing());
        registry.add_link(fake.endpoint()).await.unwrap();

        let reading = registry.get_weight("127.0.0.1").await.unwrap();
        assert_eq!(reading.display(), "4.500 kg");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_link_closes_and_forgets() {
        let fake = FakeScale::start(FakeBehavior::answering()).await;
        let sink = RecordingSink::new();
        let registry = registry_with(fast_config(), sink.clone(), FixedIdentity::failing());
        registry.add_link(fake.endpoint()).await.unwrap();
        registry.start_streaming(Some("127.0.0.1")).await.unwrap();
        wait_until(|| sink.count(&SinkCall::Enter("127.0.0.1".into())) == 1).await;

        let link = registry.link("127.0.0.1").await.unwrap();
        let mut events = registry.subscribe();
        registry.remove_link("127.0.0.1").await;

        assert!(link.is_closed());
        assert_eq!(registry.link_count().await, 0);
        assert!(!registry.is_streaming_requested("127.0.0.1").await);
        assert_eq!(sink.count(&SinkCall::Leave("127.0.0.1".into())), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::LinkRemoved {
                scale_id: "127.0.0.1".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_once() {
        let good = FakeScale::start(FakeBehavior::answering()).await;
        let dead = FakeScale::start(FakeBehavior::silent()).await;
        let sink = RecordingSink::new();
        let registry = registry_with(fast_config(), sink.clone(), FixedIdentity::failing());
        registry.add_link(good.endpoint().with_id("a")).await.unwrap();
        registry.add_link(dead.endpoint().with_id("b")).await.unwrap();
        registry.start_streaming(Some("a")).await.unwrap();

        let a = registry.link("a").await.unwrap();
        let b = registry.link("b").await.unwrap();
        assert_eq!(registry.pending_retries().await, 1);

        registry.shutdown().await;
        registry.shutdown().await;

        assert_eq!(sink.count(&SinkCall::Close), 1);
        assert_eq!(sink.calls().last(), Some(&SinkCall::Close));
        assert_eq!(sink.count(&SinkCall::Leave("a".into())), 1);
        assert_eq!(sink.count(&SinkCall::Leave("b".into())), 1);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(registry.link_count().await, 0);
        assert_eq!(registry.pending_retries().await, 0);
        assert!(registry.add_link(good.endpoint()).await.is_err());

        sleep(Duration::from_millis(50)).await;
        assert_eq!(good.received().last().map(Vec::as_slice), Some(STOP_STREAMING));

        // Nothing left running probes the dead scale
        let probes = dead.count(Command::StopStreaming);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(dead.count(Command::StopStreaming), probes);
    }
}
