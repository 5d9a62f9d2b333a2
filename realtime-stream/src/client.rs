//! Stream client and connection lifecycle
//!
//! [`StreamClient`] owns one logical connection to a stream endpoint and
//! multiplexes any number of channel subscriptions over it. The transport
//! may drop at any time; the client reconnects with backoff and replays
//! every subscription, so subscribers never notice beyond a gap in payloads.
//!
//! Every public method is synchronous and returns immediately. Opening the
//! transport, reading frames and waiting out reconnect delays happen on
//! spawned tasks, so methods that start work (`connect`, `subscribe`, ...)
//! must be called from within a tokio runtime.
//!
//! Each transport connection is an *epoch*. `connect()` and `disconnect()`
//! bump the epoch counter; tasks belonging to an older epoch notice and exit
//! without touching state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectAttempt;
use crate::config::StreamConfig;
use crate::error::{ClientError, ClientErrorKind, StreamError, StreamResult};
use crate::frame::{ClientFrame, FrameSender};
use crate::handlers::{DisconnectReason, EventHandlers};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatStats};
use crate::registry::{CallbackId, ChannelCallback, ChannelRegistry, RegistryStats, Removal};
use crate::router::MessageRouter;
use crate::token::{StaticToken, TokenProvider};
use crate::topics::{decode_payload, Topic};
use crate::transport::{
    is_normal_close, Connector, TransportCommand, TransportEvent, TransportHandle,
    WebSocketConnector, CLOSE_ABNORMAL, CLOSE_NORMAL,
};

const CLIENT_DISCONNECT_REASON: &str = "Client disconnect";

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected, or the server closed the connection normally
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Open; frames flow in both directions
    Connected,
    /// Waiting for the next reconnect attempt (or out of attempts)
    Reconnecting,
    /// Shut down by `disconnect()`
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    /// Caller invoked `connect()`
    Explicit,
    /// Reconnect timer scheduled after the close of `epoch` fired
    Timer { epoch: u64 },
}

struct Lifecycle {
    state: ConnectionState,
    epoch: u64,
    attempt: ReconnectAttempt,
    outbound: Option<mpsc::UnboundedSender<TransportCommand>>,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Dropping this wakes the current connection task
    shutdown: Option<oneshot::Sender<()>>,
}

struct Shared {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    router: MessageRouter,
    lifecycle: Mutex<Lifecycle>,
}

enum AfterClose {
    Stop,
    Retry { delay: Duration, attempt: u32 },
    Exhausted { attempts: u32 },
}

impl FrameSender for Shared {
    fn send_frame(&self, frame: ClientFrame) -> bool {
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {:?}: {}", frame, e);
                return false;
            }
        };

        let lifecycle = self.lifecycle.lock();
        if lifecycle.state != ConnectionState::Connected {
            debug!(state = %lifecycle.state, "Not connected, dropping outbound frame");
            return false;
        }
        match &lifecycle.outbound {
            Some(outbound) => outbound.send(TransportCommand::Text(text)).is_ok(),
            None => false,
        }
    }
}

impl Shared {
    fn handlers(&self) -> &EventHandlers {
        self.router.handlers()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lifecycle.lock().epoch == epoch
    }

    fn start_connect(self: &Arc<Self>, origin: ConnectOrigin) {
        let (epoch, shutdown_rx) = {
            let mut lifecycle = self.lifecycle.lock();
            match (origin, lifecycle.state) {
                (_, ConnectionState::Connecting | ConnectionState::Connected) => return,
                (ConnectOrigin::Timer { epoch }, state) => {
                    if state != ConnectionState::Reconnecting || lifecycle.epoch != epoch {
                        return;
                    }
                    // we are the timer; nothing to cancel
                    lifecycle.reconnect_timer = None;
                }
                (ConnectOrigin::Explicit, _) => {
                    if let Some(timer) = lifecycle.reconnect_timer.take() {
                        timer.abort();
                    }
                    lifecycle.attempt.reset(&self.config.backoff);
                }
            }

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            lifecycle.epoch += 1;
            lifecycle.state = ConnectionState::Connecting;
            lifecycle.outbound = None;
            lifecycle.shutdown = Some(shutdown_tx);
            (lifecycle.epoch, shutdown_rx)
        };

        debug!(epoch, endpoint = %self.config.endpoint, "Connecting");
        self.handlers().emit_state_change(ConnectionState::Connecting);

        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run_connection(epoch, shutdown_rx).await });
    }

    async fn open_transport(&self) -> StreamResult<TransportHandle> {
        let token = self.tokens.token()?;
        let url = self.config.stream_url(token.as_deref())?;

        match tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&url)).await
        {
            Ok(result) => result,
            Err(_) => Err(StreamError::ConnectTimeout(self.config.connect_timeout)),
        }
    }

    async fn run_connection(self: Arc<Self>, epoch: u64, mut shutdown: oneshot::Receiver<()>) {
        let opened = tokio::select! {
            result = self.open_transport() => result,
            _ = &mut shutdown => return,
        };

        let mut handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                warn!(endpoint = %self.config.endpoint, "Connection attempt failed: {}", e);
                if self.is_current(epoch) {
                    self.handlers()
                        .emit_error(&ClientError::new(ClientErrorKind::Transport, e.to_string()));
                }
                self.handle_close(epoch, CLOSE_ABNORMAL, e.to_string());
                return;
            }
        };

        if !self.on_open(epoch, handle.sender.clone()) {
            let _ = handle.sender.send(TransportCommand::Close {
                code: CLOSE_NORMAL,
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            });
            return;
        }

        loop {
            let deadline = self.router.heartbeat().deadline();
            let event = tokio::select! {
                event = handle.events.recv() => event,
                _ = &mut shutdown => return,
                _ = heartbeat_expiry(deadline) => {
                    warn!(
                        timeout = ?self.router.heartbeat().timeout(),
                        "No heartbeat from server, dropping connection"
                    );
                    self.handle_close(epoch, CLOSE_ABNORMAL, "heartbeat timeout".to_string());
                    return;
                }
            };

            match event {
                Some(TransportEvent::Message(text)) => {
                    let outcome = self.router.route(&text, &*self);
                    debug!(?outcome, "Routed inbound frame");
                }
                Some(TransportEvent::Error(message)) => {
                    warn!("Transport error: {}", message);
                    self.handlers()
                        .emit_error(&ClientError::new(ClientErrorKind::Transport, message));
                }
                Some(TransportEvent::Closed { code, reason }) => {
                    self.handle_close(epoch, code, reason);
                    return;
                }
                None => {
                    self.handle_close(epoch, CLOSE_ABNORMAL, "transport dropped".to_string());
                    return;
                }
            }

            // a callback may have disconnected or reconnected the client
            if !self.is_current(epoch) {
                return;
            }
        }
    }

    /// Transition to `Connected` and replay subscriptions. Returns false if
    /// the epoch went stale while the transport was opening.
    fn on_open(&self, epoch: u64, sender: mpsc::UnboundedSender<TransportCommand>) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.epoch != epoch || lifecycle.state != ConnectionState::Connecting {
                return false;
            }
            lifecycle.state = ConnectionState::Connected;
            lifecycle.outbound = Some(sender);
            lifecycle.attempt.reset(&self.config.backoff);
        }

        self.router.heartbeat().reset();
        info!(endpoint = %self.config.endpoint, "Stream connected");

        let replayed = self.router.registry().replay(|frame| {
            self.send_frame(frame);
        });
        if self.router.is_paused() {
            self.send_frame(ClientFrame::Pause);
        }
        debug!(channels = replayed, paused = self.router.is_paused(), "Replayed subscriptions");

        self.handlers().emit_state_change(ConnectionState::Connected);
        self.handlers().emit_connect();
        true
    }

    fn handle_close(self: &Arc<Self>, epoch: u64, code: u16, reason: String) {
        let (state, after) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.epoch != epoch || lifecycle.state == ConnectionState::Closed {
                debug!(epoch, code, "Ignoring close from stale connection");
                return;
            }
            lifecycle.outbound = None;
            lifecycle.shutdown = None;

            let after = if is_normal_close(code) {
                lifecycle.state = ConnectionState::Disconnected;
                AfterClose::Stop
            } else {
                lifecycle.state = ConnectionState::Reconnecting;
                let policy = &self.config.backoff;
                if policy.is_exhausted(lifecycle.attempt.count) {
                    AfterClose::Exhausted {
                        attempts: lifecycle.attempt.count,
                    }
                } else {
                    let delay = lifecycle.attempt.advance(policy);
                    lifecycle.reconnect_timer = Some(self.schedule_reconnect(epoch, delay));
                    AfterClose::Retry {
                        delay,
                        attempt: lifecycle.attempt.count,
                    }
                }
            };
            (lifecycle.state, after)
        };

        let will_reconnect = matches!(after, AfterClose::Retry { .. });
        match &after {
            AfterClose::Stop => info!(code, reason = %reason, "Server closed the stream"),
            AfterClose::Retry { delay, attempt } => info!(
                code,
                reason = %reason,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Connection lost, reconnect scheduled"
            ),
            AfterClose::Exhausted { attempts } => {
                error!(attempts, "Reconnection attempts exhausted, giving up")
            }
        }

        self.handlers().emit_state_change(state);
        self.handlers().emit_disconnect(&DisconnectReason {
            code,
            reason,
            will_reconnect,
        });

        if let AfterClose::Exhausted { attempts } = after {
            self.handlers().emit_error(&ClientError::new(
                ClientErrorKind::BackoffExhausted,
                format!("Gave up reconnecting after {} attempts", attempts),
            ));
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, epoch: u64, delay: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.start_connect(ConnectOrigin::Timer { epoch });
        })
    }

    fn disconnect(&self) {
        let (outbound, timer, shutdown) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ConnectionState::Closed {
                return;
            }
            lifecycle.state = ConnectionState::Closed;
            lifecycle.epoch += 1;
            lifecycle.attempt.reset(&self.config.backoff);
            (
                lifecycle.outbound.take(),
                lifecycle.reconnect_timer.take(),
                lifecycle.shutdown.take(),
            )
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(outbound) = outbound {
            let _ = outbound.send(TransportCommand::Close {
                code: CLOSE_NORMAL,
                reason: CLIENT_DISCONNECT_REASON.to_string(),
            });
        }
        drop(shutdown);
        self.router.set_paused(false);

        info!(endpoint = %self.config.endpoint, "Stream closed by client");
        self.handlers().emit_state_change(ConnectionState::Closed);
    }
}

async fn heartbeat_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reconnecting, multiplexed stream client.
///
/// Cheap to clone; clones share the same connection. Dropping the last
/// clone closes the connection and cancels any pending reconnect.
///
/// # Example
///
/// ```rust,no_run
/// use realtime_stream::{StaticToken, StreamClient, StreamConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = StreamClient::builder(StreamConfig::metrics())
///     .token_provider(StaticToken::new("secret"))
///     .build()?;
///
/// let _metrics = client.subscribe("system_metrics", |payload| {
///     println!("cpu: {}", payload["cpu"]);
/// });
/// client.connect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StreamClient {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

/// Held only by `StreamClient` clones. Spawned tasks keep `Shared` alive, so
/// the connection is shut down here rather than in `Shared`'s drop.
struct Owner(Arc<Shared>);

impl Drop for Owner {
    fn drop(&mut self) {
        let state = self.0.lifecycle.lock().state;
        if !matches!(state, ConnectionState::Disconnected | ConnectionState::Closed) {
            debug!(endpoint = %self.0.config.endpoint, "Last client dropped");
            self.0.disconnect();
        }
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.shared.config.endpoint)
            .field("state", &self.state())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl StreamClient {
    pub fn builder(config: StreamConfig) -> StreamClientBuilder {
        StreamClientBuilder::new(config)
    }

    /// Client over WebSocket with no token.
    pub fn new(config: StreamConfig) -> StreamResult<Self> {
        Self::builder(config).build()
    }

    /// Open the connection. No-op while connecting or connected.
    ///
    /// Cancels a pending reconnect and starts a fresh backoff sequence, so
    /// this is also how a client that ran out of attempts is revived.
    pub fn connect(&self) {
        self.shared.start_connect(ConnectOrigin::Explicit);
    }

    /// Close the connection with code 1000 and stop reconnecting.
    ///
    /// Subscriptions are kept; a later `connect()` replays them. The pause
    /// flag is cleared. Safe to call from inside any callback.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Write a control frame. Dropped unless connected.
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.shared.send_frame(frame)
    }

    /// Register `callback` for every payload published on `channel`.
    pub fn subscribe<F>(&self, channel: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_callback(channel.into(), Arc::new(callback))
    }

    /// Register a typed callback for topic `T`.
    ///
    /// Payloads that do not decode as `T::Payload` are logged and skipped
    /// for this callback.
    pub fn subscribe_topic<T, F>(&self, callback: F) -> SubscriptionHandle
    where
        T: Topic + 'static,
        F: Fn(T::Payload) + Send + Sync + 'static,
    {
        let typed: ChannelCallback = Arc::new(move |payload: &Value| {
            match decode_payload::<T>(payload) {
                Ok(decoded) => callback(decoded),
                Err(e) => warn!(
                    channel = T::CHANNEL,
                    "Dropping payload that does not match topic: {}", e
                ),
            }
        });
        self.subscribe_callback(T::CHANNEL.to_string(), typed)
    }

    fn subscribe_callback(&self, channel: String, callback: ChannelCallback) -> SubscriptionHandle {
        let (id, _) = self.shared.router.registry().insert_then(&channel, callback, |frame| {
            if self.shared.send_frame(frame) {
                debug!(channel = %channel, "Subscribed");
            }
        });

        SubscriptionHandle {
            shared: Arc::downgrade(&self.shared),
            channel,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Stop delivering channel payloads. Heartbeats are still answered.
    pub fn pause(&self) {
        if !self.shared.router.set_paused(true) {
            self.shared.send_frame(ClientFrame::Pause);
        }
    }

    /// Resume delivering channel payloads.
    pub fn resume(&self) {
        if self.shared.router.set_paused(false) {
            self.shared.send_frame(ClientFrame::Resume);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.router.is_paused()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current reconnect bookkeeping.
    pub fn reconnect_attempt(&self) -> ReconnectAttempt {
        self.shared.lifecycle.lock().attempt
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    /// Channels with at least one subscriber.
    pub fn channels(&self) -> Vec<String> {
        self.shared.router.registry().channels()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.shared.router.registry().stats()
    }

    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.shared.router.heartbeat().stats()
    }
}

/// Returned by `subscribe`; detaches exactly one callback.
///
/// Dropping the handle does not unsubscribe.
pub struct SubscriptionHandle {
    shared: Weak<Shared>,
    channel: String,
    id: CallbackId,
    active: AtomicBool,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove this callback. Later calls do nothing.
    ///
    /// When it was the channel's last callback, `unsubscribe` is sent to the
    /// server (if connected).
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let removal = shared.router.registry().remove_then(&self.channel, self.id, |frame| {
            shared.send_frame(frame);
        });
        if removal == Removal::ChannelEmptied {
            debug!(channel = %self.channel, "Unsubscribed");
        }
    }
}

/// Wires a [`StreamClient`] together.
pub struct StreamClientBuilder {
    config: StreamConfig,
    connector: Option<Arc<dyn Connector>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    handlers: EventHandlers,
}

impl StreamClientBuilder {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            connector: None,
            tokens: None,
            handlers: EventHandlers::default(),
        }
    }

    /// Transport to use. Defaults to [`WebSocketConnector`].
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Where the bearer token comes from. Defaults to no token.
    pub fn token_provider(mut self, tokens: impl TokenProvider) -> Self {
        self.tokens = Some(Arc::new(tokens));
        self
    }

    pub fn token(self, token: impl Into<String>) -> Self {
        self.token_provider(StaticToken::new(token))
    }

    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn build(self) -> StreamResult<StreamClient> {
        self.config.validate()?;

        let heartbeat = HeartbeatMonitor::new(self.config.heartbeat_timeout);
        let router = MessageRouter::new(Arc::new(ChannelRegistry::new()), heartbeat, self.handlers);
        let attempt = ReconnectAttempt::new(&self.config.backoff);

        let shared = Arc::new(Shared {
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WebSocketConnector::new())),
            tokens: self.tokens.unwrap_or_else(|| Arc::new(StaticToken::none())),
            config: self.config,
            router,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Disconnected,
                epoch: 0,
                attempt,
                outbound: None,
                reconnect_timer: None,
                shutdown: None,
            }),
        });

        Ok(StreamClient {
            _owner: Arc::new(Owner(Arc::clone(&shared))),
            shared,
        })
    }
}
