use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::codec::Encoder;
use tracing::{debug, info, trace, warn};

use super::{bind_socket, local_bind_addr, IdentityResolver};
use crate::core::{Error, Result, ScaleEndpointConfig, ScaleHealth, WeightReading};
use crate::protocol::{
    Command, ConnectionState, FrameCodec, FrameDecoder, LinkSettings, LinkTimers, TimerEvent,
};
use crate::telemetry::MetricsRecorder;
use crate::util::duration_to_millis;

/// Depth of the command queue between a handle and its driver
const COMMAND_QUEUE_SIZE: usize = 32;

/// Something that happened on a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Handshake confirmed
    Connected { scale_id: String },
    /// A connected or connecting link lost its device
    Disconnected { scale_id: String, reason: String },
    /// A decoded weight frame
    Weight(WeightReading),
    /// A status reply, payload is the full frame text
    Status { scale_id: String, payload: String },
    /// A failure the link is recovering from on its own
    Error { scale_id: String, error: Error },
}

impl LinkEvent {
    pub fn scale_id(&self) -> &str {
        match self {
            LinkEvent::Connected { scale_id }
            | LinkEvent::Disconnected { scale_id, .. }
            | LinkEvent::Status { scale_id, .. }
            | LinkEvent::Error { scale_id, .. } => scale_id,
            LinkEvent::Weight(reading) => &reading.scale_id,
        }
    }
}

enum LinkCommand {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Stream {
        command: Command,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        command: Command,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearReading,
    Rename {
        scale_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one scale.
///
/// The socket, the decoder and every timer live in a driver task spawned by
/// [`ScaleLink::spawn`]. Handles are cheap to clone and talk to the driver
/// over a command queue, so datagrams from one device are always decoded in
/// arrival order and no state transition can race another.
#[derive(Clone)]
pub struct ScaleLink {
    endpoint: Arc<ScaleEndpointConfig>,
    settings: Arc<LinkSettings>,
    commands: mpsc::Sender<LinkCommand>,
    health: watch::Receiver<ScaleHealth>,
    resolver: Arc<dyn IdentityResolver>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl fmt::Debug for ScaleLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let health = self.health.borrow();
        f.debug_struct("ScaleLink")
            .field("scale_id", &health.scale_id)
            .field("remote", &self.endpoint.remote_addr())
            .field("state", &health.state)
            .finish()
    }
}

impl ScaleLink {
    /// Spawns the driver for `endpoint` and returns its handle together with
    /// the link's event stream. The link stays idle until [`connect`](Self::connect).
    pub fn spawn(
        endpoint: ScaleEndpointConfig,
        settings: LinkSettings,
        resolver: Arc<dyn IdentityResolver>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> (ScaleLink, mpsc::UnboundedReceiver<LinkEvent>) {
        let scale_id = endpoint.provisional_id();
        let endpoint = Arc::new(endpoint);
        let settings = Arc::new(settings);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) =
            watch::channel(ScaleHealth::new(scale_id, endpoint.address));

        let driver = LinkDriver::new(
            endpoint.clone(),
            settings.clone(),
            metrics.clone(),
            command_rx,
            event_tx,
            health_tx,
        );
        tokio::spawn(driver.run());

        let link = ScaleLink {
            endpoint,
            settings,
            commands: command_tx,
            health: health_rx,
            resolver,
            metrics,
        };
        (link, event_rx)
    }

    /// Current logical id
    pub fn scale_id(&self) -> String {
        self.health.borrow().scale_id.clone()
    }

    pub fn endpoint(&self) -> &ScaleEndpointConfig {
        &self.endpoint
    }

    /// Latest health snapshot; never fails, even after close
    pub fn health(&self) -> ScaleHealth {
        self.health.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.health.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether the driver has shut down
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Watch channel carrying every health change
    pub fn subscribe_health(&self) -> watch::Receiver<ScaleHealth> {
        self.health.clone()
    }

    /// Binds, probes and waits for the handshake. Resolves immediately when
    /// already connected; joins the attempt in flight when one is pending.
    pub async fn connect(&self) -> Result<()> {
        self.request(|reply| LinkCommand::Connect { reply }).await
    }

    pub async fn start_streaming(&self) -> Result<()> {
        self.request(|reply| LinkCommand::Stream {
            command: Command::StartStreaming,
            reply,
        })
        .await
    }

    pub async fn stop_streaming(&self) -> Result<()> {
        self.request(|reply| LinkCommand::Stream {
            command: Command::StopStreaming,
            reply,
        })
        .await
    }

    /// Sends a raw command; rejected unless the link is connected
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.request(|reply| LinkCommand::Send { command, reply }).await
    }

    /// Streams until one reading arrives, then stops streaming again
    pub async fn get_weight(&self, timeout: Duration) -> Result<WeightReading> {
        self.commands
            .send(LinkCommand::ClearReading)
            .await
            .map_err(|_| self.closed_error())?;
        self.start_streaming().await?;

        let deadline = Instant::now() + timeout;
        let mut poll = interval(self.settings.weight_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            poll.tick().await;

            let latest = self.health.borrow().last_weight.clone();
            if let Some(reading) = latest {
                self.stop_after_poll().await;
                return Ok(reading);
            }

            if Instant::now() >= deadline {
                self.stop_after_poll().await;
                return Err(Error::WeightTimeout {
                    scale_id: self.scale_id(),
                    timeout_ms: duration_to_millis(timeout),
                });
            }
        }
    }

    async fn stop_after_poll(&self) {
        if let Err(e) = self.stop_streaming().await {
            debug!(scale_id = %self.scale_id(), error = %e, "stop after weight poll failed");
        }
    }

    /// Looks up the device serial without renaming the link. Any failure
    /// yields the provisional id.
    pub async fn lookup_scale_id(&self) -> String {
        let address = self.endpoint.address;
        match self.resolver.resolve(address).await {
            Ok(serial) => serial,
            Err(e) => {
                let fallback = self.endpoint.provisional_id();
                debug!(%address, error = %e, %fallback, "identity lookup failed");
                self.metrics.record_error(&fallback, e.kind());
                fallback
            }
        }
    }

    /// Asks the device for its serial and adopts it as the logical id.
    /// Falls back to the provisional id on any failure.
    pub async fn resolve_scale_id(&self) -> String {
        let scale_id = self.lookup_scale_id().await;
        if scale_id != self.scale_id() {
            if let Err(e) = self.set_scale_id(scale_id.clone()).await {
                debug!(
                    address = %self.endpoint.address,
                    error = %e,
                    "could not apply resolved id"
                );
            }
        }
        scale_id
    }

    /// Replaces the logical id carried by health snapshots and events
    pub async fn set_scale_id(&self, scale_id: String) -> Result<()> {
        self.request(|reply| LinkCommand::Rename { scale_id, reply })
            .await
    }

    /// Whether both handles drive the same link
    pub fn same_link(&self, other: &ScaleLink) -> bool {
        self.commands.same_channel(&other.commands)
    }

    /// Cancels every timer, stops streaming if needed and closes the socket.
    /// Returns once the driver has exited; a pending connect fails with
    /// [`Error::LinkClosed`] before this resolves.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(LinkCommand::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
        self.commands.closed().await;
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> LinkCommand,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(build(reply)).await.is_err() {
            return Err(self.closed_error());
        }
        response.await.unwrap_or_else(|_| Err(self.closed_error()))
    }

    fn closed_error(&self) -> Error {
        Error::LinkClosed(self.scale_id())
    }
}

struct LinkDriver {
    endpoint: Arc<ScaleEndpointConfig>,
    settings: Arc<LinkSettings>,
    scale_id: String,
    state: ConnectionState,
    socket: Option<UdpSocket>,
    recv_buf: Vec<u8>,
    codec: FrameCodec,
    send_buf: BytesMut,
    decoder: FrameDecoder,
    timers: LinkTimers,
    streaming: bool,
    attempt: u32,
    /// Arrival of the last datagram from the device, handshake included
    last_datagram: Option<Instant>,
    /// Callers waiting on the connect attempt in flight
    waiters: Vec<oneshot::Sender<Result<()>>>,
    commands: mpsc::Receiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
    health: watch::Sender<ScaleHealth>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl LinkDriver {
    fn new(
        endpoint: Arc<ScaleEndpointConfig>,
        settings: Arc<LinkSettings>,
        metrics: Arc<dyn MetricsRecorder>,
        commands: mpsc::Receiver<LinkCommand>,
        events: mpsc::UnboundedSender<LinkEvent>,
        health: watch::Sender<ScaleHealth>,
    ) -> Self {
        LinkDriver {
            scale_id: endpoint.provisional_id(),
            state: ConnectionState::Idle,
            socket: None,
            recv_buf: vec![0u8; settings.recv_buffer_size],
            codec: FrameCodec::new(),
            send_buf: BytesMut::with_capacity(64),
            decoder: FrameDecoder::new(),
            timers: LinkTimers::new(),
            streaming: false,
            attempt: 0,
            last_datagram: None,
            waiters: Vec::new(),
            endpoint,
            settings,
            commands,
            events,
            health,
            metrics,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        break;
                    }
                }
                received = recv_datagram(self.socket.as_ref(), &mut self.recv_buf) => {
                    self.on_datagram(received);
                }
                fired = self.timers.next() => self.on_timer(fired).await,
            }
        }
        trace!(scale_id = %self.scale_id, "link driver exited");
    }

    async fn handle_command(&mut self, command: LinkCommand) -> ControlFlow<()> {
        match command {
            LinkCommand::Connect { reply } => self.request_connect(reply).await,
            LinkCommand::Stream { command, reply } => {
                self.streaming = command == Command::StartStreaming;
                let streaming = self.streaming;
                self.update_health(|h| h.streaming = streaming);
                let _ = reply.send(self.send(command, true).await);
            }
            LinkCommand::Send { command, reply } => {
                let _ = reply.send(self.send(command, true).await);
            }
            LinkCommand::ClearReading => self.update_health(|h| h.last_weight = None),
            LinkCommand::Rename { scale_id, reply } => {
                info!(from = %self.scale_id, to = %scale_id, "scale id resolved");
                self.scale_id = scale_id.clone();
                self.update_health(|h| h.scale_id = scale_id);
                let _ = reply.send(Ok(()));
            }
            LinkCommand::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn request_connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.state.is_connected() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.waiters.push(reply);
        if self.state == ConnectionState::AwaitingHandshake {
            return;
        }
        self.timers.cancel_reconnect();
        self.attempt_connect().await;
    }

    async fn attempt_connect(&mut self) {
        self.drop_socket();
        self.set_state(ConnectionState::Binding);

        let socket = match bind_socket(local_bind_addr(&self.endpoint)) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(scale_id = %self.scale_id, error = %e, "bind failed");
                return self.fail(e, false);
            }
        };
        info!(
            scale_id = %self.scale_id,
            local = ?socket.local_addr().ok(),
            remote = %self.endpoint.remote_addr(),
            "socket bound"
        );
        self.socket = Some(socket);
        self.set_state(ConnectionState::AwaitingHandshake);
        self.timers.arm_validation(self.settings.validation_timeout);

        // The stop command doubles as the probe; any reply confirms the device.
        if let Err(e) = self.send(Command::StopStreaming, false).await {
            self.fail(e, false);
        }
    }

    async fn send(&mut self, command: Command, require_connected: bool) -> Result<()> {
        if require_connected && !self.state.is_connected() {
            return Err(Error::NotConnected(self.scale_id.clone()));
        }

        self.send_buf.clear();
        self.codec.encode(command, &mut self.send_buf)?;

        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::NotConnected(self.scale_id.clone()))?;

        match socket.send_to(&self.send_buf, self.endpoint.remote_addr()).await {
            Ok(_) => {
                debug!(scale_id = %self.scale_id, command = command.name(), "command sent");
                Ok(())
            }
            Err(e) => {
                let err = Error::from(e);
                warn!(
                    scale_id = %self.scale_id,
                    command = command.name(),
                    error = %err,
                    "command send failed"
                );
                self.metrics.record_error(&self.scale_id, err.kind());
                Err(err)
            }
        }
    }

    fn on_datagram(&mut self, received: io::Result<(usize, SocketAddr)>) {
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                let err = Error::from(e);
                warn!(scale_id = %self.scale_id, error = %err, "socket error");
                return self.fail(err, true);
            }
        };

        if from != self.endpoint.remote_addr() {
            trace!(scale_id = %self.scale_id, %from, "ignoring datagram from unexpected source");
            return;
        }

        self.last_datagram = Some(Instant::now());
        let now = SystemTime::now();
        self.update_health(|h| h.last_seen = Some(now));

        match self.state {
            ConnectionState::AwaitingHandshake => self.complete_handshake(),
            ConnectionState::Connected => self.decode(len, now),
            _ => {}
        }
    }

    fn complete_handshake(&mut self) {
        self.timers.disarm_validation();
        self.timers.start_heartbeat(self.settings.heartbeat_interval);
        self.attempt = 0;
        self.streaming = false;
        self.set_state(ConnectionState::Connected);
        self.update_health(|h| {
            h.error_count = 0;
            h.reconnect_attempts = 0;
        });
        self.metrics.record_connection(&self.scale_id, true);

        info!(scale_id = %self.scale_id, remote = %self.endpoint.remote_addr(), "scale connected");
        self.emit(LinkEvent::Connected {
            scale_id: self.scale_id.clone(),
        });
        self.settle(Ok(()));
    }

    fn decode(&mut self, len: usize, now: SystemTime) {
        self.update_health(|h| h.last_activity = Some(now));

        for frame in self.decoder.append(&self.recv_buf[..len]) {
            if frame.is_status() {
                debug!(scale_id = %self.scale_id, payload = %frame.raw, "status frame");
                self.emit(LinkEvent::Status {
                    scale_id: self.scale_id.clone(),
                    payload: frame.raw,
                });
                continue;
            }

            if let Some(reading) = frame.into_reading(&self.scale_id) {
                trace!(scale_id = %self.scale_id, weight = %reading.display(), "weight frame");
                self.metrics.record_weight(&self.scale_id);
                let latest = reading.clone();
                self.update_health(|h| h.last_weight = Some(latest));
                self.emit(LinkEvent::Weight(reading));
            }
        }
    }

    async fn on_timer(&mut self, fired: TimerEvent) {
        match fired {
            TimerEvent::ValidationExpired => {
                let timeout_ms = duration_to_millis(self.settings.validation_timeout);
                warn!(scale_id = %self.scale_id, timeout_ms, "handshake not answered");
                self.fail(Error::ValidationTimeout { timeout_ms }, false);
            }
            TimerEvent::Heartbeat => self.check_activity(),
            TimerEvent::ReconnectDue => {
                info!(scale_id = %self.scale_id, attempt = self.attempt, "reconnecting");
                self.attempt_connect().await;
            }
        }
    }

    fn check_activity(&mut self) {
        // Nothing heard yet means the handshake is still pending
        let Some(last) = self.last_datagram else {
            return;
        };

        let silent = last.elapsed();
        if silent > self.settings.inactivity_timeout {
            let elapsed_ms = duration_to_millis(silent);
            warn!(scale_id = %self.scale_id, elapsed_ms, "scale inactive");
            self.fail(Error::InactivityTimeout { elapsed_ms }, true);
        } else if self.streaming && silent > self.settings.streaming_stall_threshold {
            warn!(
                scale_id = %self.scale_id,
                silent_ms = duration_to_millis(silent),
                "no data while streaming"
            );
        }
    }

    /// Tears the attempt or connection down and schedules the next one
    fn fail(&mut self, err: Error, disconnected: bool) {
        let was_connected = self.state.is_connected();

        self.timers.stop_heartbeat();
        self.timers.disarm_validation();
        self.drop_socket();
        self.streaming = false;
        self.last_datagram = None;

        self.update_health(|h| h.record_error(&err));
        self.metrics.record_error(&self.scale_id, err.kind());
        if was_connected {
            self.metrics.record_connection(&self.scale_id, false);
        }

        if disconnected {
            self.emit(LinkEvent::Disconnected {
                scale_id: self.scale_id.clone(),
                reason: err.to_string(),
            });
        }
        self.emit(LinkEvent::Error {
            scale_id: self.scale_id.clone(),
            error: err.clone(),
        });
        self.settle(Err(err));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.settings.reconnect.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.timers.schedule_reconnect(delay);
        self.set_state(ConnectionState::Reconnecting);

        let attempt = self.attempt;
        self.update_health(|h| h.reconnect_attempts = attempt);
        self.metrics.record_reconnect(&self.scale_id, attempt);
        info!(
            scale_id = %self.scale_id,
            delay_ms = duration_to_millis(delay),
            attempt,
            "reconnect scheduled"
        );
    }

    async fn shutdown(&mut self) {
        self.timers.cancel_all();

        let was_connected = self.state.is_connected();
        if was_connected && self.streaming {
            if let Err(e) = self.send(Command::StopStreaming, true).await {
                debug!(scale_id = %self.scale_id, error = %e, "stop on close failed");
            }
        }

        self.streaming = false;
        self.drop_socket();
        self.last_datagram = None;
        self.settle(Err(Error::LinkClosed(self.scale_id.clone())));
        self.set_state(ConnectionState::Idle);
        if was_connected {
            self.metrics.record_connection(&self.scale_id, false);
        }
        info!(scale_id = %self.scale_id, "link closed");
    }

    fn settle(&mut self, result: Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn drop_socket(&mut self) {
        self.socket = None;
        self.decoder.clear();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(scale_id = %self.scale_id, from = ?self.state, to = ?state, "state change");
        }
        self.state = state;
        let streaming = self.streaming;
        self.update_health(|h| {
            h.state = state;
            h.is_connected = state.is_connected();
            h.streaming = streaming;
        });
    }

    fn update_health(&self, update: impl FnOnce(&mut ScaleHealth)) {
        self.health.send_modify(update);
    }

    fn emit(&self, event: LinkEvent) {
        // The registry may have dropped the receiver while removing the link
        let _ = self.events.send(event);
    }
}

async fn recv_datagram(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
