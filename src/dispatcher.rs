use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::channel::Channel;
use crate::connection::{WebsocketConnection, run_worker};
use crate::event::{EVENT_CLIENT_CONNECTED, EVENT_PONG, Event, EventCallback};
use crate::metrics::METRICS;
use crate::transport::{SocketFactory, default_socket_factory};

/// Seconds `connect` waits for the server handshake before giving up.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection state of the client.
///
/// Transitions:
/// - `Disconnected -> Connecting` on `connect`
/// - `Connecting -> Connected` when the server sends `client_connected`
/// - `Connecting -> Disconnected` on timeout, close or transport error
/// - `Connected -> Disconnected` on `disconnect` or transport close
///
/// There is no direct `Disconnected -> Connected` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a [`WebsocketRails::reconnect`] call: the state the client
/// ended up in, plus every channel that was re-subscribed.
pub struct Reconnection {
    pub state: ConnectionState,
    pub channels: Vec<Channel>,
}

/// ============================================================
/// WebsocketRails
/// ============================================================
///
/// The client dispatcher. Owns the connection state, the event queue,
/// the channel registry and the global callback table, and routes every
/// inbound frame to the right consumer.
///
/// Responsibilities:
/// - Connection lifecycle (`connect` / `disconnect` / `reconnect`)
/// - Acknowledgement correlation through the event queue
/// - Channel subscription management
/// - Global event-name callbacks
///
/// THREADING:
/// - Cheap to clone; clones share all state
/// - Safe to use from any task; inbound dispatch runs on the
///   connection worker task
/// - User callbacks are never invoked while an internal lock is held,
///   so a callback may freely call back into the client
#[derive(Clone)]
pub struct WebsocketRails {
    inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    url: String,
    connect_timeout_secs: AtomicU64,

    // Independent protected regions. These are never nested and never
    // held across I/O or a user callback.
    state: Mutex<ConnectionState>,
    event_queue: Mutex<HashMap<u64, Event>>,
    channels: Mutex<HashMap<String, Channel>>,
    callbacks: Mutex<HashMap<String, Vec<EventCallback>>>,

    on_open: Mutex<Option<EventCallback>>,
    on_close: Mutex<Option<EventCallback>>,
    on_fail: Mutex<Option<EventCallback>>,

    conn: Mutex<Option<Arc<WebsocketConnection>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    socket_factory: Mutex<SocketFactory>,
}

impl WebsocketRails {
    /// Creates a client for the given WebSocket URL.
    ///
    /// Nothing happens on the network until `connect` is called.
    pub fn new(url: &str) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                url: url.to_string(),
                connect_timeout_secs: AtomicU64::new(DEFAULT_CONNECT_TIMEOUT_SECS),
                state: Mutex::new(ConnectionState::Disconnected),
                event_queue: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                on_open: Mutex::new(None),
                on_close: Mutex::new(None),
                on_fail: Mutex::new(None),
                conn: Mutex::new(None),
                worker: Mutex::new(None),
                socket_factory: Mutex::new(default_socket_factory()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DispatcherInner>) -> Self {
        Self { inner }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Overrides the handshake timeout used by `connect`.
    pub fn set_connect_timeout(&self, secs: u64) {
        self.inner.connect_timeout_secs.store(secs, Ordering::Relaxed);
    }

    /// Swaps the transport factory.
    ///
    /// The default dials the URL with tokio-tungstenite; embedders (and
    /// this crate's own tests) can plug in anything that implements the
    /// `WireSocket` seam.
    pub fn set_socket_factory(&self, factory: SocketFactory) {
        *self.inner.socket_factory.lock().unwrap() = factory;
    }

    // --------------------------------------------------------
    // Connection lifecycle
    // --------------------------------------------------------

    /// Opens the connection and waits for the server handshake.
    ///
    /// Blocks the caller in 1-second sleeps until the `client_connected`
    /// event arrives or the timeout elapses, in which case the connection
    /// is torn down again and `Disconnected` is returned.
    pub async fn connect(&self) -> ConnectionState {
        // A connect on top of a live worker tears the old one down first.
        if self.inner.worker.lock().unwrap().is_some() {
            self.disconnect().await;
        }

        self.set_state(ConnectionState::Connecting);
        info!("connecting to {}", self.inner.url);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(WebsocketConnection::new(outbound_tx));
        *self.inner.conn.lock().unwrap() = Some(conn.clone());

        let factory = self.inner.socket_factory.lock().unwrap().clone();
        let connecting = (factory)(self.inner.url.clone());
        let worker = tokio::spawn(run_worker(self.clone(), conn, connecting, outbound_rx));
        *self.inner.worker.lock().unwrap() = Some(worker);

        let timeout = self.inner.connect_timeout_secs.load(Ordering::Relaxed);
        let mut waited = 0u64;
        loop {
            match self.state() {
                ConnectionState::Connected => return ConnectionState::Connected,

                // The worker already gave up (dial failure or transport
                // error), so there is nothing left to wait for.
                ConnectionState::Disconnected => return self.disconnect().await,

                ConnectionState::Connecting => {}
            }

            if waited == timeout {
                warn!("connect timed out after {}s", timeout);
                METRICS.connect_timeouts.fetch_add(1, Ordering::Relaxed);
                return self.disconnect().await;
            }
            sleep(Duration::from_secs(1)).await;
            waited += 1;
        }
    }

    /// Closes the connection and joins the worker. Safe in any state.
    pub async fn disconnect(&self) -> ConnectionState {
        // Flagging the state first marks the close as deliberate, so the
        // worker's close path does not fire `on_close`.
        self.set_state(ConnectionState::Disconnected);

        let conn = self.inner.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            conn.close();
        }

        let worker = self.inner.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        debug!("disconnected from {}", self.inner.url);
        ConnectionState::Disconnected
    }

    /// Re-establishes the connection, replays unacknowledged events and
    /// re-subscribes every channel.
    ///
    /// Replayed events keep their original ids, so a late result from the
    /// old connection still correlates. Their order relative to events
    /// triggered after the reconnect is unspecified.
    pub async fn reconnect(&self) -> Reconnection {
        METRICS.reconnects.fetch_add(1, Ordering::Relaxed);
        let old_connection_id = self.raw_connection_id();
        self.disconnect().await;

        let mut channels = Vec::new();
        if self.connect().await == ConnectionState::Connected {
            // Events born on the old connection that never saw a result
            // are sent again. They are still present in the queue, so
            // `trigger_event` re-sends without re-inserting.
            let replay: Vec<Event> = {
                let queue = self.inner.event_queue.lock().unwrap();
                queue
                    .values()
                    .filter(|e| !e.is_result() && e.connection_id() == old_connection_id)
                    .cloned()
                    .collect()
            };
            for event in replay {
                debug!("replaying event {} ('{}')", event.id(), event.name());
                METRICS.events_replayed.fetch_add(1, Ordering::Relaxed);
                self.trigger_event(event);
            }

            channels = self.reconnect_channels();
        }

        Reconnection {
            state: self.state(),
            channels,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The connection id assigned by the server, or an empty string while
    /// not connected.
    pub fn connection_id(&self) -> String {
        if self.is_connected() {
            self.raw_connection_id()
        } else {
            String::new()
        }
    }

    // --------------------------------------------------------
    // Events
    // --------------------------------------------------------

    /// Installs a handler for a server-originated event name.
    pub fn bind<F>(&self, event_name: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        callbacks
            .entry(event_name.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Drops all handlers bound under `event_name`.
    pub fn unbind_all(&self, event_name: &str) {
        self.inner.callbacks.lock().unwrap().remove(event_name);
    }

    /// Triggers a named event on the server.
    pub fn trigger(&self, event_name: &str, data: Value) {
        let event = Event::local(event_name, None, data, &self.raw_connection_id(), None, None);
        self.trigger_event(event);
    }

    /// Triggers a named event and runs exactly one of the two callbacks
    /// when the server acknowledges it.
    pub fn trigger_with_ack<S, F>(&self, event_name: &str, data: Value, on_success: S, on_failure: F)
    where
        S: Fn(Value) + Send + Sync + 'static,
        F: Fn(Value) + Send + Sync + 'static,
    {
        let event = Event::local(
            event_name,
            None,
            data,
            &self.raw_connection_id(),
            Some(Arc::new(on_success)),
            Some(Arc::new(on_failure)),
        );
        self.trigger_event(event);
    }

    /// Queues and sends an already constructed event.
    ///
    /// The queue insert is idempotent on the event id while the send is
    /// unconditional: that is what lets a reconnect replay a queued event
    /// without creating a duplicate entry.
    pub fn trigger_event(&self, event: Event) {
        {
            let mut queue = self.inner.event_queue.lock().unwrap();
            queue.entry(event.id()).or_insert_with(|| event.clone());
        }

        let conn = self.inner.conn.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.trigger(&event);
        }
    }

    // --------------------------------------------------------
    // Channels
    // --------------------------------------------------------

    /// Subscribes to a public channel. Subscribing to the same name twice
    /// returns the existing channel unchanged.
    pub fn subscribe(&self, channel_name: &str) -> Channel {
        self.subscribe_internal(channel_name, false, None, None, None)
    }

    /// `subscribe` with callbacks for the subscription handshake.
    pub fn subscribe_with_ack<S, F>(&self, channel_name: &str, on_success: S, on_failure: F) -> Channel
    where
        S: Fn(Value) + Send + Sync + 'static,
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribe_internal(
            channel_name,
            false,
            None,
            Some(Arc::new(on_success)),
            Some(Arc::new(on_failure)),
        )
    }

    /// Subscribes to a private channel.
    pub fn subscribe_private(&self, channel_name: &str) -> Channel {
        self.subscribe_internal(channel_name, true, None, None, None)
    }

    /// `subscribe_private` with callbacks for the subscription handshake.
    pub fn subscribe_private_with_ack<S, F>(
        &self,
        channel_name: &str,
        on_success: S,
        on_failure: F,
    ) -> Channel
    where
        S: Fn(Value) + Send + Sync + 'static,
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribe_internal(
            channel_name,
            true,
            None,
            Some(Arc::new(on_success)),
            Some(Arc::new(on_failure)),
        )
    }

    /// Subscribes to a private channel, forwarding an opaque auth payload
    /// inside the subscribe frame. The payload is never inspected here;
    /// authorization is entirely the server's business.
    pub fn subscribe_private_with_auth(&self, channel_name: &str, auth: Value) -> Channel {
        self.subscribe_internal(channel_name, true, Some(auth), None, None)
    }

    /// Unsubscribes and removes the channel. Unknown names are ignored.
    pub fn unsubscribe(&self, channel_name: &str) {
        self.unsubscribe_internal(channel_name, None, None);
    }

    /// `unsubscribe` with callbacks for the unsubscribe acknowledgement.
    pub fn unsubscribe_with_ack<S, F>(&self, channel_name: &str, on_success: S, on_failure: F)
    where
        S: Fn(Value) + Send + Sync + 'static,
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.unsubscribe_internal(
            channel_name,
            Some(Arc::new(on_success)),
            Some(Arc::new(on_failure)),
        );
    }

    // --------------------------------------------------------
    // Connection lifecycle callbacks
    // --------------------------------------------------------

    /// Runs when the server handshake completes, with the handshake data.
    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        *self.inner.on_open.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Runs when the transport closes underneath a live connection.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        *self.inner.on_close.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Runs when the transport fails.
    pub fn on_fail<F>(&self, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        *self.inner.on_fail.lock().unwrap() = Some(Arc::new(handler));
    }

    // --------------------------------------------------------
    // Inbound routing
    // --------------------------------------------------------

    /// Decodes one inbound text frame and dispatches every tuple in it.
    ///
    /// Routing order per tuple:
    /// 1. Result frames resolve the matching queued event
    /// 2. Channel events go to the channel's handlers
    /// 3. Protocol pings are answered with a pong
    /// 4. Everything else fans out to the global handlers
    ///
    /// The `client_connected` handshake check runs after the primary
    /// dispatch, while the client is still `Connecting`.
    ///
    /// Undecodable frames, results for unknown ids and events for unknown
    /// channels are dropped without error.
    pub(crate) fn new_message(&self, raw: &str) {
        METRICS.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame: Value = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                METRICS.frames_undecodable.fetch_add(1, Ordering::Relaxed);
                debug!("dropping undecodable frame: {}", e);
                return;
            }
        };
        let Some(tuples) = frame.as_array() else {
            METRICS.frames_undecodable.fetch_add(1, Ordering::Relaxed);
            debug!("dropping frame that is not a tuple array");
            return;
        };

        for tuple in tuples {
            let Some(event) = Event::from_tuple(tuple) else {
                debug!("dropping malformed tuple");
                continue;
            };

            self.dispatch_inbound(&event);

            if self.state() == ConnectionState::Connecting
                && event.name() == EVENT_CLIENT_CONNECTED
            {
                self.connection_established(event.data().clone());
            }
        }
    }

    fn dispatch_inbound(&self, event: &Event) {
        if event.is_result() {
            let origin = {
                let mut queue = self.inner.event_queue.lock().unwrap();
                queue.remove(&event.id())
            };
            match origin {
                Some(origin) => {
                    METRICS.results_matched.fetch_add(1, Ordering::Relaxed);
                    origin.run_callbacks(event.is_success(), event.data().clone());
                }
                None => {
                    METRICS.results_unmatched.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping result for unknown event id {}", event.id());
                }
            }
        } else if let Some(channel_name) = event.channel() {
            let channel = {
                let channels = self.inner.channels.lock().unwrap();
                channels.get(channel_name).cloned()
            };
            match channel {
                Some(channel) => channel.dispatch(event.name(), event.data().clone()),
                None => debug!("dropping event for unknown channel '{}'", channel_name),
            }
        } else if event.is_ping() {
            self.pong();
        } else {
            self.dispatch_global(event);
        }
    }

    fn dispatch_global(&self, event: &Event) {
        let handlers: Vec<EventCallback> = {
            let callbacks = self.inner.callbacks.lock().unwrap();
            match callbacks.get(event.name()) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };

        METRICS.global_dispatches.fetch_add(1, Ordering::Relaxed);
        for handler in handlers {
            handler(event.data().clone());
        }
    }

    fn connection_established(&self, data: Value) {
        let connection_id = data
            .get("connection_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        info!("connection established, id '{}'", connection_id);

        self.set_state(ConnectionState::Connected);

        let conn = self.inner.conn.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.set_connection_id(&connection_id);
            conn.flush_queue();
        }

        let on_open = self.inner.on_open.lock().unwrap().clone();
        if let Some(on_open) = on_open {
            on_open(data);
        }
    }

    /// Answers a protocol ping. Pongs bypass the event queue; nobody is
    /// waiting for a result on them.
    fn pong(&self) {
        METRICS.pings_answered.fetch_add(1, Ordering::Relaxed);
        let conn = self.inner.conn.lock().unwrap().clone();
        if let Some(conn) = conn {
            let pong = Event::local(EVENT_PONG, None, json!({}), &conn.connection_id(), None, None);
            conn.trigger(&pong);
        }
    }

    // --------------------------------------------------------
    // Worker notifications
    // --------------------------------------------------------

    /// The transport closed underneath us.
    ///
    /// The event queue and the channel registry are left intact so a
    /// later `reconnect` can replay and re-subscribe.
    pub(crate) fn handle_transport_close(&self, reason: &str) {
        if self.enter_disconnected() == ConnectionState::Disconnected {
            // Deliberate disconnect, already handled.
            return;
        }
        METRICS.transport_closes.fetch_add(1, Ordering::Relaxed);
        warn!("connection closed: {}", reason);

        let on_close = self.inner.on_close.lock().unwrap().clone();
        if let Some(on_close) = on_close {
            on_close(json!({ "reason": reason }));
        }
    }

    /// The transport failed.
    pub(crate) fn handle_transport_error(&self, reason: &str) {
        if self.enter_disconnected() == ConnectionState::Disconnected {
            return;
        }
        METRICS.transport_errors.fetch_add(1, Ordering::Relaxed);
        warn!("connection failed: {}", reason);

        let on_fail = self.inner.on_fail.lock().unwrap().clone();
        if let Some(on_fail) = on_fail {
            on_fail(json!({ "reason": reason }));
        }
    }

    // --------------------------------------------------------
    // Internals
    // --------------------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().unwrap() = state;
    }

    /// Flips to `Disconnected` and reports the state found beforehand.
    fn enter_disconnected(&self) -> ConnectionState {
        let mut state = self.inner.state.lock().unwrap();
        let was = *state;
        *state = ConnectionState::Disconnected;
        was
    }

    /// The adapter's connection id regardless of state. Events keep being
    /// tagged with the id of the connection they were born on, which is
    /// what the reconnect replay filter matches against.
    pub(crate) fn raw_connection_id(&self) -> String {
        let conn = self.inner.conn.lock().unwrap().clone();
        conn.map(|c| c.connection_id()).unwrap_or_default()
    }

    pub(crate) fn remove_channel(&self, channel_name: &str) {
        self.inner.channels.lock().unwrap().remove(channel_name);
    }

    fn subscribe_internal(
        &self,
        channel_name: &str,
        private: bool,
        auth: Option<Value>,
        on_success: Option<EventCallback>,
        on_failure: Option<EventCallback>,
    ) -> Channel {
        let existing = {
            let channels = self.inner.channels.lock().unwrap();
            channels.get(channel_name).cloned()
        };
        if let Some(channel) = existing {
            return channel;
        }

        let channel = Channel::new(
            channel_name,
            private,
            auth,
            Arc::downgrade(&self.inner),
            on_success,
            on_failure,
        );
        {
            let mut channels = self.inner.channels.lock().unwrap();
            // Someone else may have registered the name meanwhile; theirs
            // wins so there is one channel record per name.
            if let Some(existing) = channels.get(channel_name) {
                return existing.clone();
            }
            channels.insert(channel_name.to_string(), channel.clone());
        }

        // The handshake event is sent outside the registry lock.
        channel.start_subscription(self);
        channel
    }

    fn unsubscribe_internal(
        &self,
        channel_name: &str,
        on_success: Option<EventCallback>,
        on_failure: Option<EventCallback>,
    ) {
        let channel = {
            let mut channels = self.inner.channels.lock().unwrap();
            channels.remove(channel_name)
        };
        if let Some(channel) = channel {
            channel.destroy_internal(on_success, on_failure);
        }
    }

    fn reconnect_channels(&self) -> Vec<Channel> {
        let channels: Vec<Channel> = {
            let registry = self.inner.channels.lock().unwrap();
            registry.values().cloned().collect()
        };

        for channel in &channels {
            debug!("re-subscribing channel '{}'", channel.name());
            channel.mark_unsubscribed();
            channel.start_subscription(self);
        }
        channels
    }

    #[cfg(test)]
    pub(crate) fn queued_event_ids(&self) -> Vec<u64> {
        let queue = self.inner.event_queue.lock().unwrap();
        let mut ids: Vec<u64> = queue.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
