//! End-to-end tests against a scripted WebsocketRails server running on a
//! local listener. The client side goes through the real tokio-tungstenite
//! transport; only the server side is played by the test.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{Message, Utf8Bytes},
};

use websocket_rails_client::{ConnectionState, WebsocketRails};

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn send_frame(ws: &mut ServerSocket, frame: Value) {
    ws.send(Message::Text(Utf8Bytes::from(frame.to_string())))
        .await
        .unwrap();
}

async fn send_handshake(ws: &mut ServerSocket, connection_id: &str) {
    send_frame(
        ws,
        json!([["client_connected", {"id": 0, "data": {"connection_id": connection_id}}, ""]]),
    )
    .await;
}

/// Next decoded text frame from the client, or None when it disconnects.
async fn next_text(ws: &mut ServerSocket) -> Option<Value> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn handshake_ack_and_ping_pong() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send_handshake(&mut ws, "C1").await;

        // Acknowledge the application event.
        let msg = next_text(&mut ws).await.unwrap();
        assert_eq!(msg[0], json!("chat.msg"));
        assert_eq!(msg[1]["data"], json!({"t": "hi"}));
        let id = msg[1]["id"].as_u64().unwrap();
        send_frame(
            &mut ws,
            json!([["chat.msg", {"id": id, "result": true, "success": true, "data": {"ok": 1}}, "C1"]]),
        )
        .await;

        // Protocol ping; the client must answer with a pong.
        send_frame(&mut ws, json!([["websocket_rails.ping", {"id": 0, "data": {}}, ""]])).await;
        let pong = next_text(&mut ws).await.unwrap();
        assert_eq!(pong[0], json!("websocket_rails.pong"));
        assert_eq!(pong[1]["data"], json!({}));
        assert_eq!(pong[2], json!("C1"));
    });

    let client = WebsocketRails::new(&url);
    assert_eq!(client.connect().await, ConnectionState::Connected);
    assert_eq!(client.connection_id(), "C1");

    let acked = Arc::new(AtomicUsize::new(0));
    {
        let acked = acked.clone();
        client.trigger_with_ack(
            "chat.msg",
            json!({"t": "hi"}),
            move |data| {
                assert_eq!(data, json!({"ok": 1}));
                acked.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );
    }
    wait_for("acknowledgement", || acked.load(Ordering::SeqCst) == 1).await;

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn channel_subscription_and_server_push() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send_handshake(&mut ws, "C1").await;

        let sub = next_text(&mut ws).await.unwrap();
        assert_eq!(sub[0], json!("websocket_rails.subscribe"));
        assert_eq!(sub[1]["data"]["channel"], json!("room"));
        let id = sub[1]["id"].as_u64().unwrap();
        send_frame(
            &mut ws,
            json!([["websocket_rails.subscribe", {"id": id, "result": true, "success": true, "data": {}}, "C1"]]),
        )
        .await;

        send_frame(
            &mut ws,
            json!([["new_message", {"id": 42, "channel": "room", "data": {"text": "hello"}}, "C1"]]),
        )
        .await;
    });

    let client = WebsocketRails::new(&url);
    assert_eq!(client.connect().await, ConnectionState::Connected);

    let channel = client.subscribe("room");
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        channel.bind("new_message", move |data| {
            seen.lock().unwrap().push(data);
        });
    }

    wait_for("subscription", || channel.is_subscribed()).await;
    wait_for("channel push", || !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!({"text": "hello"})]);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn reconnect_replays_the_unacked_event() {
    let (listener, url) = bind_server().await;
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Value>();

    let server = tokio::spawn(async move {
        // First connection: handshake, receive one event, never ack it.
        let mut ws = accept(&listener).await;
        send_handshake(&mut ws, "C1").await;
        let first = next_text(&mut ws).await.unwrap();
        frames_tx.send(first).unwrap();
        while next_text(&mut ws).await.is_some() {}

        // Second connection: handshake, expect the replay.
        let mut ws = accept(&listener).await;
        send_handshake(&mut ws, "C2").await;
        let replayed = next_text(&mut ws).await.unwrap();
        frames_tx.send(replayed).unwrap();
    });

    let client = WebsocketRails::new(&url);
    assert_eq!(client.connect().await, ConnectionState::Connected);
    assert_eq!(client.connection_id(), "C1");

    client.trigger("job.run", json!({"n": 11}));
    let first = frames_rx.recv().await.unwrap();
    assert_eq!(first[0], json!("job.run"));
    let original_id = first[1]["id"].as_u64().unwrap();

    let outcome = client.reconnect().await;
    assert_eq!(outcome.state, ConnectionState::Connected);
    assert_eq!(client.connection_id(), "C2");

    let replayed = frames_rx.recv().await.unwrap();
    assert_eq!(replayed[0], json!("job.run"));
    assert_eq!(replayed[1]["id"].as_u64().unwrap(), original_id);
    assert_eq!(replayed[1]["data"], json!({"n": 11}));

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn connect_gives_up_without_the_server_handshake() {
    let (listener, url) = bind_server().await;

    tokio::spawn(async move {
        // Accept the socket but never speak the protocol.
        let mut ws = accept(&listener).await;
        while ws.next().await.is_some() {}
    });

    let client = WebsocketRails::new(&url);
    client.set_connect_timeout(1);

    let opened = Arc::new(AtomicBool::new(false));
    {
        let opened = opened.clone();
        client.on_open(move |_| {
            opened.store(true, Ordering::SeqCst);
        });
    }

    assert_eq!(client.connect().await, ConnectionState::Disconnected);
    assert!(!opened.load(Ordering::SeqCst));
    assert_eq!(client.connection_id(), "");
}
