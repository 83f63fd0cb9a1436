use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, Utf8Bytes},
};

/// A transport-level notification delivered to the connection worker.
///
/// The raw WebSocket is treated as a duplex text stream. Everything the
/// dispatcher needs to know about it is reduced to these three cases;
/// framing, TLS and the HTTP upgrade are the transport's problem.
#[derive(Debug)]
pub enum WireEvent {
    /// A complete inbound text frame.
    Message(String),

    /// The peer closed the connection (or the stream ended).
    Closed(String),

    /// The transport failed.
    Error(String),
}

/// WireSocket is the seam between the protocol core and the raw
/// WebSocket implementation.
///
/// RESPONSIBILITIES:
/// - Deliver inbound text frames and close/error notifications
/// - Accept outbound text frames
/// - Perform the closing handshake on request
///
/// THREAD SAFETY:
/// - The two halves returned by `split` are driven concurrently by a
///   single worker task (reads in one select arm, writes in another)
///
/// The production implementation wraps tokio-tungstenite. Tests drive the
/// dispatcher through a scripted in-memory implementation instead, which
/// keeps the protocol logic testable without sockets.
pub trait WireSocket: Send {
    fn split(self: Box<Self>) -> (Box<dyn WireWriter>, Box<dyn WireReader>);
}

/// Write half of a [`WireSocket`].
#[async_trait::async_trait]
pub trait WireWriter: Send {
    /// Sends a single outbound text frame.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Initiates the closing handshake. Errors are not interesting here;
    /// the connection is going away either way.
    async fn close(&mut self);
}

/// Read half of a [`WireSocket`].
///
/// CONTRACT:
/// - `next_event` must never panic
/// - Non-text frames (ping/pong/binary) are handled or ignored internally
/// - End of stream is reported as `WireEvent::Closed`
#[async_trait::async_trait]
pub trait WireReader: Send {
    async fn next_event(&mut self) -> WireEvent;
}

/// Factory producing a fresh socket per connection attempt.
///
/// The dispatcher calls this once per `connect`, so reconnecting always
/// starts from a clean transport.
pub type SocketFactory =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Box<dyn WireSocket>>> + Send + Sync>;

/// Returns the default tokio-tungstenite backed factory.
pub fn default_socket_factory() -> SocketFactory {
    Arc::new(|url: String| -> BoxFuture<'static, Result<Box<dyn WireSocket>>> {
        Box::pin(async move {
            let (socket, _) = connect_async(url.as_str()).await?;
            debug!("websocket transport established: {}", url);
            Ok(Box::new(TungsteniteSocket { socket }) as Box<dyn WireSocket>)
        })
    })
}

// ------------------------------------------------------------
// tokio-tungstenite implementation
// ------------------------------------------------------------

struct TungsteniteSocket {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

struct TungsteniteWriter {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

struct TungsteniteReader {
    stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WireSocket for TungsteniteSocket {
    fn split(self: Box<Self>) -> (Box<dyn WireWriter>, Box<dyn WireReader>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(TungsteniteWriter { sink }),
            Box::new(TungsteniteReader { stream }),
        )
    }
}

#[async_trait::async_trait]
impl WireWriter for TungsteniteWriter {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink.send(Message::Text(Utf8Bytes::from(text))).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[async_trait::async_trait]
impl WireReader for TungsteniteReader {
    async fn next_event(&mut self) -> WireEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return WireEvent::Message(text.to_string());
                }

                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by peer".to_string());
                    return WireEvent::Closed(reason);
                }

                // Transport-level ping/pong and binary frames are not part
                // of the application protocol.
                Some(Ok(_)) => {}

                Some(Err(e)) => return WireEvent::Error(e.to_string()),

                None => return WireEvent::Closed("stream ended".to_string()),
            }
        }
    }
}

// ------------------------------------------------------------
// Scripted in-memory socket for tests
// ------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Test-side handle for one scripted connection.
    ///
    /// Each factory invocation yields a fresh handle, delivered through the
    /// channel returned by `scripted_factory`. The test plays the server:
    /// it injects inbound wire events and observes outbound frames.
    pub(crate) struct ScriptHandle {
        inbound: mpsc::UnboundedSender<WireEvent>,
        outbound: mpsc::UnboundedReceiver<String>,
    }

    impl ScriptHandle {
        pub(crate) fn server_send(&self, frame: &str) {
            let _ = self.inbound.send(WireEvent::Message(frame.to_string()));
        }

        pub(crate) fn server_close(&self, reason: &str) {
            let _ = self.inbound.send(WireEvent::Closed(reason.to_string()));
        }

        pub(crate) fn server_error(&self, reason: &str) {
            let _ = self.inbound.send(WireEvent::Error(reason.to_string()));
        }

        /// Next frame the client wrote, or None once the writer is gone.
        pub(crate) async fn sent(&mut self) -> Option<String> {
            self.outbound.recv().await
        }

        pub(crate) fn try_sent(&mut self) -> Option<String> {
            self.outbound.try_recv().ok()
        }
    }

    struct ScriptedSocket {
        inbound: mpsc::UnboundedReceiver<WireEvent>,
        outbound: mpsc::UnboundedSender<String>,
    }

    struct ScriptedWriter {
        outbound: mpsc::UnboundedSender<String>,
    }

    struct ScriptedReader {
        inbound: mpsc::UnboundedReceiver<WireEvent>,
    }

    impl WireSocket for ScriptedSocket {
        fn split(self: Box<Self>) -> (Box<dyn WireWriter>, Box<dyn WireReader>) {
            (
                Box::new(ScriptedWriter {
                    outbound: self.outbound,
                }),
                Box::new(ScriptedReader {
                    inbound: self.inbound,
                }),
            )
        }
    }

    #[async_trait::async_trait]
    impl WireWriter for ScriptedWriter {
        async fn send_text(&mut self, text: String) -> Result<()> {
            self.outbound
                .send(text)
                .map_err(|_| anyhow::anyhow!("scripted peer went away"))
        }

        async fn close(&mut self) {}
    }

    #[async_trait::async_trait]
    impl WireReader for ScriptedReader {
        async fn next_event(&mut self) -> WireEvent {
            match self.inbound.recv().await {
                Some(event) => event,
                None => WireEvent::Closed("script finished".to_string()),
            }
        }
    }

    /// Builds a factory whose sockets are driven by the test.
    ///
    /// A new [`ScriptHandle`] is pushed into the returned receiver for every
    /// connection the dispatcher opens, so reconnect scenarios can script
    /// each connection generation separately.
    pub(crate) fn scripted_factory() -> (SocketFactory, mpsc::UnboundedReceiver<ScriptHandle>) {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();

        let factory: SocketFactory = Arc::new(
            move |_url: String| -> BoxFuture<'static, Result<Box<dyn WireSocket>>> {
                let handles_tx = handles_tx.clone();
                Box::pin(async move {
                    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    let _ = handles_tx.send(ScriptHandle {
                        inbound: inbound_tx,
                        outbound: outbound_rx,
                    });
                    Ok(Box::new(ScriptedSocket {
                        inbound: inbound_rx,
                        outbound: outbound_tx,
                    }) as Box<dyn WireSocket>)
                })
            },
        );

        (factory, handles_rx)
    }
}
