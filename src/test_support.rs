//! Fakes shared by the unit tests

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::core::{Error, Result, ScaleEndpointConfig, ScaleHealth};
use crate::network::IdentityResolver;
use crate::protocol::{Command, ETX, START_STREAMING, STOP_STREAMING, STX};
use crate::telemetry::{MetricsRecorder, TelemetrySink};

/// Wraps frame text in the protocol markers
pub(crate) fn frame(body: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(body.len() + 2);
    bytes.push(STX);
    bytes.extend_from_slice(body.as_bytes());
    bytes.push(ETX);
    bytes
}

/// What a [`FakeScale`] does with the commands it receives
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    /// Sent back for every stop command, the handshake probe included
    pub probe_reply: Option<Vec<u8>>,
    /// Sent back, in order, for every start command
    pub stream: Vec<Vec<u8>>,
}

impl FakeBehavior {
    /// Never answers anything
    pub fn silent() -> Self {
        FakeBehavior::default()
    }

    /// Answers the probe with a status frame
    pub fn answering() -> Self {
        FakeBehavior {
            probe_reply: Some(frame("0100e101101054")),
            stream: Vec::new(),
        }
    }

    /// Answers the probe and replies to a start command with `frames`
    pub fn streaming(frames: &[&str]) -> Self {
        FakeBehavior {
            stream: frames.iter().map(|body| frame(body)).collect(),
            ..FakeBehavior::answering()
        }
    }
}

/// Scripted UDP device on loopback
pub(crate) struct FakeScale {
    socket: Arc<UdpSocket>,
    behavior: Arc<Mutex<FakeBehavior>>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    task: JoinHandle<()>,
}

impl FakeScale {
    pub async fn start(behavior: FakeBehavior) -> FakeScale {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let peer = Arc::new(Mutex::new(None));
        let behavior = Arc::new(Mutex::new(behavior));

        let task = tokio::spawn({
            let socket = socket.clone();
            let behavior = behavior.clone();
            let received = received.clone();
            let peer = peer.clone();
            async move {
                let mut buf = [0u8; 2048];
                while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                    let data = buf[..len].to_vec();
                    received.lock().unwrap().push(data.clone());
                    *peer.lock().unwrap() = Some(from);

                    let script = behavior.lock().unwrap().clone();
                    if data == STOP_STREAMING {
                        if let Some(reply) = &script.probe_reply {
                            let _ = socket.send_to(reply, from).await;
                        }
                    } else if data == START_STREAMING {
                        for frame in &script.stream {
                            let _ = socket.send_to(frame, from).await;
                        }
                    }
                }
            }
        });

        FakeScale {
            socket,
            behavior,
            received,
            peer,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    /// Endpoint a link uses to reach this fake
    pub fn endpoint(&self) -> ScaleEndpointConfig {
        ScaleEndpointConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, self.port())
    }

    /// Every datagram received so far
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, command: Command) -> usize {
        self.received()
            .iter()
            .filter(|data| data.as_slice() == command.as_bytes())
            .count()
    }

    /// Address of the last link that talked to this fake
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap()
    }

    /// Swaps the script for every datagram received from now on
    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Sends raw bytes to the last peer
    pub async fn push(&self, bytes: &[u8]) {
        let peer = self.peer().expect("no peer has contacted the fake yet");
        self.socket.send_to(bytes, peer).await.unwrap();
    }
}

impl Drop for FakeScale {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Polls `check` every 20ms for up to two seconds
pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within two seconds");
}

/// One call made against a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkCall {
    Weight(String, String),
    Status(String),
    Enter(String),
    Update(String),
    Leave(String),
    Close,
}

/// Sink that records every call. It can be told to fail weight publishes
/// and to answer status publishes slowly.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    failing_weights: AtomicUsize,
    status_delay_ms: AtomicU64,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingSink::default())
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn weights(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::Weight(id, value) => Some((id, value)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &SinkCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Ids left announced after replaying every enter and leave
    pub fn roster(&self) -> BTreeSet<String> {
        let mut roster = BTreeSet::new();
        for call in self.calls() {
            match call {
                SinkCall::Enter(id) => {
                    roster.insert(id);
                }
                SinkCall::Leave(id) => {
                    roster.remove(&id);
                }
                _ => {}
            }
        }
        roster
    }

    /// Holds every status publish for `delay` before recording it
    pub fn delay_status(&self, delay: Duration) {
        self.status_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes the next `n` weight publishes fail
    pub fn fail_next_weights(&self, n: usize) {
        self.failing_weights.store(n, Ordering::SeqCst);
    }

    fn record(&self, call: SinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn publish_weight(&self, scale_id: &str, value: &str) -> Result<()> {
        let failing = self
            .failing_weights
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::telemetry("publish rejected"));
        }
        self.record(SinkCall::Weight(scale_id.to_string(), value.to_string()));
        Ok(())
    }

    async fn publish_status(&self, scale_id: &str, _health: &ScaleHealth) -> Result<()> {
        let delay = self.status_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.record(SinkCall::Status(scale_id.to_string()));
        Ok(())
    }

    async fn presence_enter(&self, health: &ScaleHealth) -> Result<()> {
        self.record(SinkCall::Enter(health.scale_id.clone()));
        Ok(())
    }

    async fn presence_update(&self, health: &ScaleHealth) -> Result<()> {
        self.record(SinkCall::Update(health.scale_id.clone()));
        Ok(())
    }

    async fn presence_leave(&self, scale_id: &str) -> Result<()> {
        self.record(SinkCall::Leave(scale_id.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(SinkCall::Close);
        Ok(())
    }
}

/// Resolver with canned answers
#[derive(Debug, Clone, Default)]
pub(crate) struct FixedIdentity {
    serial: Option<String>,
}

impl FixedIdentity {
    /// Every address resolves to `serial`
    pub fn serial(serial: &str) -> Self {
        FixedIdentity {
            serial: Some(serial.to_string()),
        }
    }

    /// Every lookup fails
    pub fn failing() -> Self {
        FixedIdentity::default()
    }
}

#[async_trait]
impl IdentityResolver for FixedIdentity {
    async fn resolve(&self, address: IpAddr) -> Result<String> {
        self.serial
            .clone()
            .ok_or_else(|| Error::identity(format!("no identity for {}", address)))
    }
}

/// Recorder counting what it is told
#[derive(Debug, Default)]
pub(crate) struct CountingMetrics {
    pub errors: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub weights: AtomicUsize,
    pub publishes: AtomicUsize,
    pub failed_publishes: AtomicUsize,
}

impl CountingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(CountingMetrics::default())
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl MetricsRecorder for CountingMetrics {
    fn record_error(&self, _scale_id: &str, _kind: &'static str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn record_reconnect(&self, _scale_id: &str, _attempt: u32) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn record_weight(&self, _scale_id: &str) {
        self.weights.fetch_add(1, Ordering::SeqCst);
    }

    fn record_publish(&self, _scale_id: &str, ok: bool) {
        if ok {
            self.publishes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed_publishes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
