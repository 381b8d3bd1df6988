use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{SignalingEnvelope, SignalingStatus};
use crate::config::Timings;
use crate::error::{LinkError, LinkResult};

#[derive(Debug, Clone)]
struct Target {
    endpoint: String,
    identity: String,
}

/// Owns the control connection to the relay.
///
/// Inbound peer envelopes are pushed into the receiver returned by [`SignalingClient::new`];
/// status changes are published on a `watch` channel.
pub struct SignalingClient {
    timings: Timings,
    status_tx: watch::Sender<SignalingStatus>,
    inbound_tx: mpsc::UnboundedSender<SignalingEnvelope>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    attempt: AsyncMutex<()>,
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    epoch: AtomicU64,
    target: Mutex<Option<Target>>,
    stopped: AtomicBool,
}

impl SignalingClient {
    pub fn new(timings: Timings) -> (Arc<Self>, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SignalingStatus::Disconnected);
        let client = Arc::new(Self {
            timings,
            status_tx,
            inbound_tx,
            outbound: Mutex::new(None),
            attempt: AsyncMutex::new(()),
            connection_tasks: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            epoch: AtomicU64::new(0),
            target: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        (client, inbound_rx)
    }

    pub fn status(&self) -> SignalingStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SignalingStatus> {
        self.status_tx.subscribe()
    }

    pub fn identity(&self) -> Option<String> {
        self.target.lock().as_ref().map(|t| t.identity.clone())
    }

    /// Opens the control channel and registers `identity`, resolving once the relay
    /// acknowledges. A no-op while already connected. Re-arms a client that was shut down.
    pub async fn connect(self: &Arc<Self>, endpoint: &str, identity: &str) -> LinkResult<()> {
        parse_endpoint(endpoint)?;
        *self.target.lock() = Some(Target {
            endpoint: endpoint.to_string(),
            identity: identity.to_string(),
        });
        self.stopped.store(false, Ordering::SeqCst);
        self.attempt_connect().await
    }

    /// One attempt toward the stored target. Refused once the client is shut down; an
    /// attempt overtaken by `shutdown` ends with the status left at Disconnected.
    async fn attempt_connect(self: &Arc<Self>) -> LinkResult<()> {
        let _attempt = self.attempt.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        if self.status() == SignalingStatus::Connected {
            return Ok(());
        }
        let target = self.target.lock().clone();
        let Some(target) = target else {
            return Err(LinkError::NotConnected);
        };
        let url = parse_endpoint(&target.endpoint)?;

        self.drop_connection();
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.set_status(SignalingStatus::Connecting);
        tracing::debug!(
            target = "tidelink::signaling",
            endpoint = %url,
            identity = %target.identity,
            epoch,
            "connecting to relay"
        );

        let outcome = tokio::time::timeout(
            self.timings.register_timeout,
            self.open(url, &target.identity, epoch),
        )
        .await
        .unwrap_or(Err(LinkError::SignalingTimeout));

        if let Err(err) = &outcome {
            self.drop_connection();
            if self.stopped.load(Ordering::SeqCst) {
                tracing::debug!(target = "tidelink::signaling", error = %err, "connect abandoned after shutdown");
                self.set_status(SignalingStatus::Disconnected);
            } else {
                tracing::warn!(target = "tidelink::signaling", error = %err, "relay connect failed");
                self.set_status(SignalingStatus::Error);
            }
        }
        outcome
    }

    /// Fails once `shutdown` or a newer attempt has replaced the connection `epoch`.
    fn ensure_current(&self, epoch: u64) -> LinkResult<()> {
        if self.stopped.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(LinkError::Connect("relay connection superseded".into()));
        }
        Ok(())
    }

    /// Connects and keeps the connection alive: one early retry after a failed first
    /// attempt, then the watchdog cadence.
    pub async fn start(self: &Arc<Self>, endpoint: &str, identity: &str) -> LinkResult<()> {
        let first = self.connect(endpoint, identity).await;
        if !self.stopped.load(Ordering::SeqCst) {
            self.spawn_supervisor(first.is_err());
        }
        first
    }

    pub fn send(&self, envelope: &SignalingEnvelope) -> LinkResult<()> {
        let text = envelope.to_text()?;
        if self.status() != SignalingStatus::Connected {
            tracing::warn!(
                target = "tidelink::signaling",
                kind = ?envelope.kind(),
                status = %self.status(),
                "dropping envelope: relay not connected"
            );
            return Err(LinkError::NotConnected);
        }
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) if tx.send(text).is_ok() => Ok(()),
            _ => {
                tracing::warn!(
                    target = "tidelink::signaling",
                    kind = ?envelope.kind(),
                    "dropping envelope: relay writer gone"
                );
                Err(LinkError::NotConnected)
            }
        }
    }

    /// Closes the connection and halts the watchdog. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.drop_connection();
        self.set_status(SignalingStatus::Disconnected);
    }

    async fn open(self: &Arc<Self>, url: Url, identity: &str, epoch: u64) -> LinkResult<()> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| LinkError::Connect(format!("websocket connect failed: {err}")))?;
        self.ensure_current(epoch)?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
        let (ack_tx, ack_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            while let Some(text) = send_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            let mut ack = Some(ack_tx);
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(target = "tidelink::signaling", "relay websocket error: {err}");
                        break;
                    }
                };
                let Some(client) = weak.upgrade() else { return };
                client.dispatch(&text, epoch, &mut ack);
            }
            if let Some(client) = weak.upgrade() {
                client.connection_lost(epoch);
            }
        });

        {
            let mut tasks = self.connection_tasks.lock();
            tasks.push(writer);
            tasks.push(reader);
        }

        let register = SignalingEnvelope::Register {
            user_id: identity.to_string(),
        };
        *self.outbound.lock() = Some(send_tx.clone());
        send_tx
            .send(register.to_text()?)
            .map_err(|_| LinkError::Connect("relay writer closed before registration".into()))?;

        ack_rx
            .await
            .map_err(|_| LinkError::Connect("relay closed before acknowledging registration".into()))?;
        self.ensure_current(epoch)
    }

    fn dispatch(&self, text: &str, epoch: u64, ack: &mut Option<oneshot::Sender<()>>) {
        let envelope = match SignalingEnvelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(
                    target = "tidelink::signaling",
                    error = %err,
                    "ignoring unrecognised relay message"
                );
                return;
            }
        };
        match envelope {
            SignalingEnvelope::RegisterAck { user_id } => {
                if self.ensure_current(epoch).is_err() {
                    tracing::debug!(target = "tidelink::signaling", epoch, "stale registration ack");
                    return;
                }
                tracing::info!(
                    target = "tidelink::signaling",
                    user_id = user_id.as_deref().unwrap_or("-"),
                    "registered with relay"
                );
                self.set_status(SignalingStatus::Connected);
                if let Some(tx) = ack.take() {
                    let _ = tx.send(());
                }
            }
            SignalingEnvelope::RelayOpen {} => {
                tracing::debug!(target = "tidelink::signaling", "relay greeted connection");
            }
            SignalingEnvelope::Register { .. } => {}
            envelope => {
                if self.inbound_tx.send(envelope).is_err() {
                    tracing::debug!(target = "tidelink::signaling", "inbound consumer gone");
                }
            }
        }
    }

    fn connection_lost(&self, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.outbound.lock().take();
        if self.status() == SignalingStatus::Connected {
            tracing::warn!(target = "tidelink::signaling", "relay connection lost");
            self.set_status(SignalingStatus::Disconnected);
        }
    }

    fn drop_connection(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.outbound.lock().take();
        for handle in self.connection_tasks.lock().drain(..) {
            handle.abort();
        }
    }

    fn set_status(&self, status: SignalingStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::debug!(target = "tidelink::signaling", %status, "signaling status changed");
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, retry_first: bool) {
        let weak = Arc::downgrade(self);
        let interval = self.timings.watchdog_interval;
        let retry_delay = self.timings.retry_delay;
        let handle = tokio::spawn(async move {
            if retry_first {
                tokio::time::sleep(retry_delay).await;
                if !reconnect(&weak).await {
                    return;
                }
            }
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !reconnect(&weak).await {
                    return;
                }
            }
        });
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }
    }
}

/// Returns false once the client is gone or shut down.
async fn reconnect(weak: &Weak<SignalingClient>) -> bool {
    let Some(client) = weak.upgrade() else {
        return false;
    };
    if client.stopped.load(Ordering::SeqCst) {
        return false;
    }
    if client.status() == SignalingStatus::Connected {
        return true;
    }
    tracing::debug!(target = "tidelink::signaling", "watchdog reconnecting");
    if let Err(err) = client.attempt_connect().await {
        tracing::debug!(target = "tidelink::signaling", error = %err, "watchdog reconnect failed");
    }
    true
}

fn parse_endpoint(endpoint: &str) -> LinkResult<Url> {
    let url = Url::parse(endpoint)
        .map_err(|err| LinkError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(LinkError::InvalidEndpoint(format!(
            "{endpoint}: unsupported scheme {other}"
        ))),
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
        for handle in self.connection_tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
