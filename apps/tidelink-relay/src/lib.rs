//! Minimal signaling relay: binds identities to WebSocket connections and forwards
//! negotiation messages between them without interpreting their payloads.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

struct RegisteredClient {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Only the routing fields; the rest of the message is forwarded untouched.
#[derive(Debug, Deserialize)]
struct Routing {
    #[serde(rename = "messageType")]
    message_type: String,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

#[derive(Clone, Default)]
pub struct RelayState {
    clients: Arc<DashMap<String, RegisteredClient>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.clients.contains_key(identity)
    }

    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Drops the registration and closes the socket that owns `identity`.
    pub fn kick(&self, identity: &str) -> bool {
        match self.clients.remove(identity) {
            Some((_, client)) => {
                info!(identity, "kicking client");
                client.tx.send(Outbound::Close).is_ok()
            }
            None => false,
        }
    }

    fn register(&self, identity: &str, conn_id: Uuid, tx: &mpsc::UnboundedSender<Outbound>) {
        let previous = self.clients.insert(
            identity.to_string(),
            RegisteredClient {
                conn_id,
                tx: tx.clone(),
            },
        );
        match previous {
            Some(old) if old.conn_id != conn_id => {
                info!(identity, "registration replaced an older connection")
            }
            _ => info!(identity, "client registered"),
        }
    }

    fn unregister(&self, identity: &str, conn_id: Uuid) {
        if self
            .clients
            .remove_if(identity, |_, client| client.conn_id == conn_id)
            .is_some()
        {
            info!(identity, "client unregistered");
        }
    }

    fn forward(&self, to: &str, text: String) -> bool {
        match self.clients.get(to) {
            Some(client) => client.tx.send(Outbound::Text(text)).is_ok(),
            None => false,
        }
    }
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/signaling", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.clients.len(),
    }))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!(%conn_id, "writer task ended");
    });

    let greeting = json!({
        "messageType": "signaling_connected",
        "message": "relay ready",
    });
    let _ = tx.send(Outbound::Text(greeting.to_string()));
    debug!(%conn_id, "websocket connected");

    let mut identity: Option<String> = None;
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => handle_text(&state, conn_id, &tx, &mut identity, text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(identity) = identity {
        state.unregister(&identity, conn_id);
    }
    writer.abort();
    debug!(%conn_id, "websocket disconnected");
}

fn handle_text(
    state: &RelayState,
    conn_id: Uuid,
    tx: &mpsc::UnboundedSender<Outbound>,
    identity: &mut Option<String>,
    text: String,
) {
    let routing = match serde_json::from_str::<Routing>(&text) {
        Ok(routing) => routing,
        Err(e) => {
            warn!(%conn_id, "failed to parse client message: {}", e);
            return;
        }
    };

    match routing.message_type.as_str() {
        "register" => {
            let Some(user_id) = routing.user_id.filter(|id| !id.is_empty()) else {
                warn!(%conn_id, "register without userId");
                return;
            };
            if let Some(previous) = identity.take() {
                if previous != user_id {
                    state.unregister(&previous, conn_id);
                }
            }
            state.register(&user_id, conn_id, tx);
            let ack = json!({
                "messageType": "registration_success",
                "userId": user_id,
            });
            let _ = tx.send(Outbound::Text(ack.to_string()));
            *identity = Some(user_id);
        }
        "webrtc_offer" | "webrtc_answer" | "webrtc_ice_candidate" => {
            let Some(to) = routing.to else {
                warn!(%conn_id, kind = %routing.message_type, "message without recipient");
                return;
            };
            if !state.forward(&to, text) {
                debug!(%conn_id, %to, kind = %routing.message_type, "recipient not registered; dropped");
            }
        }
        other => debug!(%conn_id, kind = other, "ignoring message type"),
    }
}
