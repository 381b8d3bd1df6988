use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tidelink_relay::{build_router, RelayState};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> (SocketAddr, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn next_json(client: &mut Client) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .ok()??;
        match msg.ok()? {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn registered_client(addr: SocketAddr, user: &str) -> Client {
    let (mut client, _) = connect_async(format!("ws://{addr}/signaling")).await.unwrap();
    let greeting = next_json(&mut client).await.unwrap();
    assert_eq!(greeting["messageType"], "signaling_connected");
    client
        .send(Message::Text(
            json!({"messageType": "register", "userId": user}).to_string(),
        ))
        .await
        .unwrap();
    let ack = next_json(&mut client).await.unwrap();
    assert_eq!(ack, json!({"messageType": "registration_success", "userId": user}));
    client
}

#[test_timeout::tokio_timeout_test(10)]
async fn forwards_negotiation_messages_verbatim() {
    let (addr, state) = spawn_relay().await;
    let mut alice = registered_client(addr, "alice").await;
    let mut bob = registered_client(addr, "bob").await;
    assert_eq!(state.registered(), vec!["alice".to_string(), "bob".to_string()]);

    let offer = json!({
        "messageType": "webrtc_offer",
        "sender": "alice",
        "to": "bob",
        "sdp": {"type": "offer", "sdp": "v=0"},
        "extra": 7
    });
    alice.send(Message::Text(offer.to_string())).await.unwrap();
    assert_eq!(next_json(&mut bob).await.unwrap(), offer);

    let candidate = json!({
        "messageType": "webrtc_ice_candidate",
        "sender": "bob",
        "to": "alice",
        "candidate": null
    });
    bob.send(Message::Text(candidate.to_string())).await.unwrap();
    assert_eq!(next_json(&mut alice).await.unwrap(), candidate);
}

#[test_timeout::tokio_timeout_test(10)]
async fn unknown_recipient_is_dropped() {
    let (addr, _state) = spawn_relay().await;
    let mut alice = registered_client(addr, "alice").await;
    let answer = json!({
        "messageType": "webrtc_answer",
        "sender": "alice",
        "to": "nobody",
        "sdp": {"type": "answer", "sdp": "v=0"}
    });
    alice.send(Message::Text(answer.to_string())).await.unwrap();

    // The connection stays usable after the drop.
    let mut bob = registered_client(addr, "bob").await;
    let offer = json!({"messageType": "webrtc_offer", "sender": "bob", "to": "alice",
        "sdp": {"type": "offer", "sdp": "v=0"}});
    bob.send(Message::Text(offer.to_string())).await.unwrap();
    assert_eq!(next_json(&mut alice).await.unwrap(), offer);
}

#[test_timeout::tokio_timeout_test(10)]
async fn kick_closes_the_socket_and_unregisters() {
    let (addr, state) = spawn_relay().await;
    let mut alice = registered_client(addr, "alice").await;
    assert!(state.kick("alice"));
    assert!(next_json(&mut alice).await.is_none());
    assert!(!state.is_registered("alice"));

    let _again = registered_client(addr, "alice").await;
    assert!(state.is_registered("alice"));
}

#[test_timeout::tokio_timeout_test(10)]
async fn closing_socket_unregisters_identity() {
    let (addr, state) = spawn_relay().await;
    let mut alice = registered_client(addr, "alice").await;
    alice.close(None).await.unwrap();
    drop(alice);

    for _ in 0..50 {
        if !state.is_registered("alice") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("alice still registered after its socket closed");
}
