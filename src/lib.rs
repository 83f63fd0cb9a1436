// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - event:      Protocol message value type, wire codec, id generation
// - channel:    Per-channel callbacks and subscription lifecycle
// - dispatcher: Client state machine, event queue, inbound routing
// - connection: Outbound adapter + the per-connection worker task
// - transport:  Seam over the raw WebSocket (tokio-tungstenite impl)
// - config:     Configuration structs for the demo binary
// - metrics:    Global lock-free runtime counters
//
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod metrics;
pub mod transport;

pub use channel::Channel;
pub use dispatcher::{ConnectionState, Reconnection, WebsocketRails};
pub use event::{Event, EventCallback};
pub use transport::{SocketFactory, WireEvent, WireReader, WireSocket, WireWriter};
