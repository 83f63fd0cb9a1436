use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use serde_json::{Value, json};

use crate::dispatcher::{DispatcherInner, WebsocketRails};
use crate::event::{
    EVENT_SUBSCRIBE, EVENT_SUBSCRIBE_PRIVATE, EVENT_UNSUBSCRIBE, Event, EventCallback,
};
use crate::metrics::METRICS;

/// A named logical channel multiplexed over the client's connection.
///
/// Channels are created through the dispatcher's `subscribe*` calls. The
/// value handed back to the caller and the record kept in the dispatcher's
/// registry share the same state, so subscribing to the same name twice
/// yields the same channel.
///
/// LIFECYCLE:
/// - Construction emits the subscribe handshake event
/// - The server's acknowledgement flips `is_subscribed`
/// - `destroy` emits the unsubscribe event and clears local state
///
/// Events triggered on a channel before the subscribe acknowledgement are
/// held back and sent, in order, once the subscription completes.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    private: bool,
    subscribed: AtomicBool,

    /// Handlers per server-originated event name, fired in bind order.
    callbacks: Mutex<HashMap<String, Vec<EventCallback>>>,

    /// Outbound events deferred until the subscription completes.
    pending: Mutex<Vec<Event>>,

    /// Application callbacks for the subscribe handshake.
    on_success: Mutex<Option<EventCallback>>,
    on_failure: Mutex<Option<EventCallback>>,

    /// Opaque auth payload forwarded on private subscribe. Never inspected.
    auth: Option<Value>,

    /// Non-owning handle back to the dispatcher. The dispatcher owns the
    /// channel registry; going through a weak handle here keeps the two
    /// from keeping each other alive.
    client: Weak<DispatcherInner>,
}

impl Channel {
    pub(crate) fn new(
        name: &str,
        private: bool,
        auth: Option<Value>,
        client: Weak<DispatcherInner>,
        on_success: Option<EventCallback>,
        on_failure: Option<EventCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                private,
                subscribed: AtomicBool::new(false),
                callbacks: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                on_success: Mutex::new(on_success),
                on_failure: Mutex::new(on_failure),
                auth,
                client,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_private(&self) -> bool {
        self.inner.private
    }

    /// True once the server acknowledged the subscribe handshake.
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::Acquire)
    }

    /// Appends a handler for a server-originated event on this channel.
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

    /// Triggers an event scoped to this channel.
    pub fn trigger(&self, event_name: &str, data: Value) {
        self.trigger_internal(event_name, data, None, None);
    }

    /// Triggers an event scoped to this channel, with acknowledgement
    /// callbacks.
    pub fn trigger_with_ack<S, F>(&self, event_name: &str, data: Value, on_success: S, on_failure: F)
    where
        S: Fn(Value) + Send + Sync + 'static,
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.trigger_internal(
            event_name,
            data,
            Some(Arc::new(on_success)),
            Some(Arc::new(on_failure)),
        );
    }

    fn trigger_internal(
        &self,
        event_name: &str,
        data: Value,
        on_success: Option<EventCallback>,
        on_failure: Option<EventCallback>,
    ) {
        let Some(client) = self.client() else {
            return;
        };
        let event = Event::local(
            event_name,
            Some(self.inner.name.clone()),
            data,
            &client.raw_connection_id(),
            on_success,
            on_failure,
        );

        if self.is_subscribed() {
            client.trigger_event(event);
        } else {
            // Held back until the subscribe acknowledgement arrives.
            debug!(
                "channel '{}' not yet subscribed, deferring '{}'",
                self.inner.name, event_name
            );
            self.inner.pending.lock().unwrap().push(event);
        }
    }

    /// Emits the unsubscribe event and clears local state.
    pub fn destroy(&self) {
        self.destroy_internal(None, None);
    }

    /// `destroy` with acknowledgement callbacks for the unsubscribe event.
    pub fn destroy_with_ack<S, F>(&self, on_success: S, on_failure: F)
    where
        S: Fn(Value) + Send + Sync + 'static,
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.destroy_internal(Some(Arc::new(on_success)), Some(Arc::new(on_failure)));
    }

    pub(crate) fn destroy_internal(
        &self,
        on_success: Option<EventCallback>,
        on_failure: Option<EventCallback>,
    ) {
        if let Some(client) = self.client() {
            let event = Event::local(
                EVENT_UNSUBSCRIBE,
                Some(self.inner.name.clone()),
                json!({"channel": self.inner.name}),
                &client.raw_connection_id(),
                on_success,
                on_failure,
            );
            client.trigger_event(event);
            client.remove_channel(&self.inner.name);
        }

        self.inner.subscribed.store(false, Ordering::Release);
        self.inner.callbacks.lock().unwrap().clear();
        self.inner.pending.lock().unwrap().clear();
    }

    /// Fans a server-originated channel event out to the bound handlers.
    ///
    /// Handlers are copied out of the table before being invoked, so a
    /// handler may call back into `bind`/`trigger` without deadlocking.
    pub(crate) fn dispatch(&self, event_name: &str, data: Value) {
        let handlers: Vec<EventCallback> = {
            let callbacks = self.inner.callbacks.lock().unwrap();
            match callbacks.get(event_name) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };

        METRICS.channel_dispatches.fetch_add(1, Ordering::Relaxed);
        for handler in handlers {
            handler(data.clone());
        }
    }

    /// Emits the subscribe handshake event for this channel.
    ///
    /// The acknowledgement callbacks close over the channel itself: on
    /// success the channel flips to subscribed and flushes its deferred
    /// events, on failure it stays unsubscribed and reports to the
    /// application.
    pub(crate) fn start_subscription(&self, client: &WebsocketRails) {
        let mut data = json!({"channel": self.inner.name});
        if let Some(auth) = &self.inner.auth {
            data["auth"] = auth.clone();
        }

        let on_ack: EventCallback = {
            let channel = self.clone();
            Arc::new(move |data: Value| channel.subscription_succeeded(data))
        };
        let on_nack: EventCallback = {
            let channel = self.clone();
            Arc::new(move |data: Value| channel.subscription_failed(data))
        };

        let event_name = if self.inner.private {
            EVENT_SUBSCRIBE_PRIVATE
        } else {
            EVENT_SUBSCRIBE
        };
        let event = Event::local(
            event_name,
            Some(self.inner.name.clone()),
            data,
            &client.raw_connection_id(),
            Some(on_ack),
            Some(on_nack),
        );
        client.trigger_event(event);
    }

    /// Resets the subscription state before a reconnect re-subscribe.
    pub(crate) fn mark_unsubscribed(&self) {
        self.inner.subscribed.store(false, Ordering::Release);
    }

    fn subscription_succeeded(&self, data: Value) {
        debug!("subscribed to channel '{}'", self.inner.name);
        self.inner.subscribed.store(true, Ordering::Release);

        // Flush events the application triggered while the handshake was
        // still in flight, preserving order.
        if let Some(client) = self.client() {
            let pending: Vec<Event> = {
                let mut pending = self.inner.pending.lock().unwrap();
                pending.drain(..).collect()
            };
            for event in pending {
                client.trigger_event(event);
            }
        }

        let on_success = self.inner.on_success.lock().unwrap().clone();
        if let Some(on_success) = on_success {
            on_success(data);
        }
    }

    fn subscription_failed(&self, data: Value) {
        warn!("subscription to channel '{}' failed", self.inner.name);

        let on_failure = self.inner.on_failure.lock().unwrap().clone();
        if let Some(on_failure) = on_failure {
            on_failure(data);
        }
    }

    fn client(&self) -> Option<WebsocketRails> {
        self.inner.client.upgrade().map(WebsocketRails::from_inner)
    }
}
