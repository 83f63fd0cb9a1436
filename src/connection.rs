use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use tokio::sync::{Notify, mpsc};

use crate::dispatcher::WebsocketRails;
use crate::event::Event;
use crate::metrics::METRICS;
use crate::transport::{WireEvent, WireSocket};

/// ============================================================
/// WebsocketConnection
/// ============================================================
///
/// The outbound face of **one connection generation**.
///
/// Responsibilities:
/// - Serialize events and hand them to the worker's writer
/// - Buffer outbound events issued before the handshake completes
/// - Hold the connection id assigned by the server
/// - Signal the worker to shut down
///
/// Design constraints:
/// - `trigger` must never block the caller
/// - The pre-handshake buffer is strictly FIFO
/// - A new instance is created per `connect`; reconnecting never reuses
///   a stale connection
pub(crate) struct WebsocketConnection {
    /// Outbound frames to the worker's writer half.
    outbound: mpsc::UnboundedSender<String>,

    /// Frames held back until the server confirms the handshake.
    holding: Mutex<VecDeque<String>>,

    /// Set once `flush_queue` ran; from then on frames go straight out.
    handshake_complete: AtomicBool,

    /// Connection id assigned by the server, empty until the handshake.
    connection_id: Mutex<String>,

    /// Tells the worker to perform the closing handshake and stop.
    shutdown: Notify,
}

impl WebsocketConnection {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outbound,
            holding: Mutex::new(VecDeque::new()),
            handshake_complete: AtomicBool::new(false),
            connection_id: Mutex::new(String::new()),
            shutdown: Notify::new(),
        }
    }

    /// Sends an event, or buffers it while the handshake is in progress.
    ///
    /// Send failures are ignored on purpose: they mean the worker is gone,
    /// and the event is still tracked in the dispatcher's queue so a later
    /// reconnect replays it.
    pub(crate) fn trigger(&self, event: &Event) {
        let frame = event.serialize();
        if self.handshake_complete.load(Ordering::Acquire) {
            METRICS.events_sent.fetch_add(1, Ordering::Relaxed);
            let _ = self.outbound.send(frame);
        } else {
            METRICS.events_buffered.fetch_add(1, Ordering::Relaxed);
            self.holding.lock().unwrap().push_back(frame);
        }
    }

    /// Drains the pre-handshake buffer in FIFO order.
    ///
    /// Called by the dispatcher exactly once per connection, at the
    /// `client_connected` transition.
    pub(crate) fn flush_queue(&self) {
        let held: Vec<String> = {
            let mut holding = self.holding.lock().unwrap();
            holding.drain(..).collect()
        };
        self.handshake_complete.store(true, Ordering::Release);
        for frame in held {
            METRICS.events_sent.fetch_add(1, Ordering::Relaxed);
            let _ = self.outbound.send(frame);
        }
    }

    pub(crate) fn set_connection_id(&self, id: &str) {
        *self.connection_id.lock().unwrap() = id.to_string();
    }

    pub(crate) fn connection_id(&self) -> String {
        self.connection_id.lock().unwrap().clone()
    }

    /// Asks the worker to close the socket and exit its loop.
    pub(crate) fn close(&self) {
        self.shutdown.notify_one();
    }

    pub(crate) async fn closed(&self) {
        self.shutdown.notified().await;
    }
}

/// Drives one connection generation to completion.
///
/// This is the only task that touches the socket. It:
/// - Waits for the transport factory to produce a socket
/// - Forwards outbound frames from the connection's channel
/// - Hands every inbound text frame to the dispatcher
/// - Reports close/error to the dispatcher and exits
///
/// TERMINATION:
/// - `close()` on the connection (graceful, sends the closing handshake)
/// - Transport close or error
/// - The connection handle being dropped (outbound channel closes)
pub(crate) async fn run_worker(
    client: WebsocketRails,
    conn: std::sync::Arc<WebsocketConnection>,
    connecting: futures_util::future::BoxFuture<'static, anyhow::Result<Box<dyn WireSocket>>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    // The transport handshake itself can hang, so it stays cancellable.
    let socket = tokio::select! {
        _ = conn.closed() => return,
        result = connecting => match result {
            Ok(socket) => socket,
            Err(e) => {
                warn!("websocket connect failed: {}", e);
                client.handle_transport_error(&e.to_string());
                return;
            }
        }
    };

    let (mut writer, mut reader) = socket.split();

    loop {
        tokio::select! {
            // Graceful shutdown requested by disconnect()
            _ = conn.closed() => {
                debug!("closing websocket on request");
                writer.close().await;
                return;
            }

            // Outbound frames from trigger / flush
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = writer.send_text(frame).await {
                            warn!("websocket send failed: {}", e);
                            client.handle_transport_error(&e.to_string());
                            return;
                        }
                    }
                    // Dispatcher dropped the connection handle
                    None => return,
                }
            }

            // Inbound traffic
            event = reader.next_event() => {
                match event {
                    WireEvent::Message(text) => client.new_message(&text),
                    WireEvent::Closed(reason) => {
                        debug!("websocket closed: {}", reason);
                        client.handle_transport_close(&reason);
                        return;
                    }
                    WireEvent::Error(reason) => {
                        warn!("websocket error: {}", reason);
                        client.handle_transport_error(&reason);
                        return;
                    }
                }
            }
        }
    }
}
