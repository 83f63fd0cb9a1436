use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// Callback type shared across the whole client.
///
/// Handlers receive the event payload (`data`) as an owned JSON value.
/// They may be invoked from the connection worker task, so they must be
/// `Send + Sync` and should return quickly.
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Reserved protocol event names.
pub const EVENT_PING: &str = "websocket_rails.ping";
pub const EVENT_PONG: &str = "websocket_rails.pong";
pub const EVENT_SUBSCRIBE: &str = "websocket_rails.subscribe";
pub const EVENT_SUBSCRIBE_PRIVATE: &str = "websocket_rails.subscribe_private";
pub const EVENT_UNSUBSCRIBE: &str = "websocket_rails.unsubscribe";
pub const EVENT_CLIENT_CONNECTED: &str = "client_connected";

// ------------------------------------------------------------
// Event id generation
// ------------------------------------------------------------
//
// Ids are handed out from a single process-wide counter so that
// every locally created event is unique for the process lifetime,
// even across multiple client instances. The server echoes the id
// back in its result frame, which is how acknowledgements are
// correlated.
//
static NEXT_EVENT_ID: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

fn next_event_id() -> u64 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A single protocol message.
///
/// An event is either locally originated (created by `trigger` or by the
/// channel lifecycle) or server-originated (parsed from an inbound frame).
///
/// WIRE FORM:
/// - One event is the positional 3-tuple `[name, payload, connection_id]`
/// - `payload` is a JSON object carrying `id`, `channel`, `data`
/// - Acknowledgement frames additionally carry `result: true` and
///   `success: bool`
///
/// An inbound text frame is a JSON array of one or more such tuples.
/// Outbound messages are a single tuple.
#[derive(Clone)]
pub struct Event {
    id: u64,
    name: String,
    channel: Option<String>,
    data: Value,
    connection_id: String,
    result: bool,
    success: bool,
    success_callback: Option<EventCallback>,
    failure_callback: Option<EventCallback>,
}

impl Event {
    /// Creates a locally originated event with a fresh id.
    ///
    /// CONTRACT:
    /// - `connection_id` tags the connection the event was born on and is
    ///   echoed on the wire. Pass an empty string when unknown.
    /// - Ack callbacks are optional; events without them are still tracked
    ///   until their result arrives so late results are absorbed silently.
    pub fn local(
        name: &str,
        channel: Option<String>,
        data: Value,
        connection_id: &str,
        success_callback: Option<EventCallback>,
        failure_callback: Option<EventCallback>,
    ) -> Self {
        Self {
            id: next_event_id(),
            name: name.to_string(),
            channel,
            data,
            connection_id: connection_id.to_string(),
            result: false,
            success: false,
            success_callback,
            failure_callback,
        }
    }

    /// Parses a single protocol tuple into an event.
    ///
    /// Returns `None` for anything that is not a well-formed tuple.
    /// Malformed tuples are dropped by the dispatcher without error, so
    /// this function must never panic.
    pub fn from_tuple(tuple: &Value) -> Option<Self> {
        let parts = tuple.as_array()?;
        let name = parts.first()?.as_str()?;
        let payload = parts.get(1)?.as_object()?;

        let connection_id = parts
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Some(Self {
            id: payload.get("id").and_then(Value::as_u64).unwrap_or(0),
            name: name.to_string(),
            channel: payload
                .get("channel")
                .and_then(Value::as_str)
                .map(str::to_string),
            data: payload.get("data").cloned().unwrap_or(Value::Null),
            connection_id,
            result: payload
                .get("result")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            success: payload
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            success_callback: None,
            failure_callback: None,
        })
    }

    /// Serializes the event into its outbound wire form.
    pub fn serialize(&self) -> String {
        let mut payload = json!({
            "id": self.id,
            "data": self.data,
        });
        if let Some(channel) = &self.channel {
            payload["channel"] = Value::String(channel.clone());
        }
        json!([self.name, payload, self.connection_id]).to_string()
    }

    /// Fires the matching acknowledgement callback, if one is installed.
    ///
    /// The dispatcher removes the event from its queue before calling this,
    /// so each callback fires at most once per event.
    pub fn run_callbacks(&self, success: bool, data: Value) {
        let callback = if success {
            &self.success_callback
        } else {
            &self.failure_callback
        };
        if let Some(callback) = callback {
            callback(data);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// True for server-to-client acknowledgement frames.
    pub fn is_result(&self) -> bool {
        self.result
    }

    /// Meaningful only when `is_result()` is true.
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_ping(&self) -> bool {
        self.name == EVENT_PING
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("connection_id", &self.connection_id)
            .field("result", &self.result)
            .field("success", &self.success)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn local_events_get_unique_ids() {
        let a = Event::local("a", None, Value::Null, "", None, None);
        let b = Event::local("b", None, Value::Null, "", None, None);
        assert_ne!(a.id(), b.id());
        assert!(!a.is_result());
    }

    #[test]
    fn parses_result_tuple() {
        let tuple = json!([
            "chat.msg",
            {"id": 7, "result": true, "success": true, "data": {"ok": 1}},
            "C1"
        ]);
        let event = Event::from_tuple(&tuple).unwrap();
        assert_eq!(event.id(), 7);
        assert_eq!(event.name(), "chat.msg");
        assert_eq!(event.connection_id(), "C1");
        assert!(event.is_result());
        assert!(event.is_success());
        assert_eq!(event.data(), &json!({"ok": 1}));
    }

    #[test]
    fn parses_channel_tuple() {
        let tuple = json!([
            "new_message",
            {"id": 42, "channel": "room", "data": {"text": "hello"}},
            "C1"
        ]);
        let event = Event::from_tuple(&tuple).unwrap();
        assert!(event.is_channel());
        assert_eq!(event.channel(), Some("room"));
        assert!(!event.is_result());
    }

    #[test]
    fn rejects_malformed_tuples() {
        assert!(Event::from_tuple(&json!("nope")).is_none());
        assert!(Event::from_tuple(&json!([])).is_none());
        assert!(Event::from_tuple(&json!([42, {}, ""])).is_none());
        assert!(Event::from_tuple(&json!(["name", "not-an-object", ""])).is_none());
    }

    #[test]
    fn serializes_to_positional_tuple() {
        let event = Event::local(
            "chat.msg",
            Some("room".to_string()),
            json!({"t": "hi"}),
            "C1",
            None,
            None,
        );
        let wire: Value = serde_json::from_str(&event.serialize()).unwrap();
        let parts = wire.as_array().unwrap();
        assert_eq!(parts[0], json!("chat.msg"));
        assert_eq!(parts[1]["id"], json!(event.id()));
        assert_eq!(parts[1]["channel"], json!("room"));
        assert_eq!(parts[1]["data"], json!({"t": "hi"}));
        assert_eq!(parts[2], json!("C1"));
    }

    #[test]
    fn run_callbacks_picks_matching_side() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let event = Event::local(
            "x",
            None,
            Value::Null,
            "",
            Some(Arc::new(|_| {
                HITS.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Arc::new(|_| {
                HITS.fetch_add(100, Ordering::SeqCst);
            })),
        );

        event.run_callbacks(true, Value::Null);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);

        event.run_callbacks(false, Value::Null);
        assert_eq!(HITS.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn run_callbacks_without_handlers_is_a_no_op() {
        let event = Event::local("x", None, Value::Null, "", None, None);
        event.run_callbacks(true, Value::Null);
        event.run_callbacks(false, Value::Null);
    }
}
