use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::message::ChatMessage;
use crate::negotiation::{Command, Engine, EngineChannels, PeerEvent};
use crate::session::{NegotiationState, Role, SessionManager, SessionSnapshot};
use crate::signaling::{SignalingClient, SignalingStatus};
use crate::transport::TransportFactory;

/// Caller-facing handle to one local endpoint.
///
/// Construction spawns the engine task, so it must happen inside a Tokio runtime.
/// Dropping the last handle stops the engine and closes any live session.
pub struct PeerLink {
    config: LinkConfig,
    signaling: Arc<SignalingClient>,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<PeerEvent>,
    engine: JoinHandle<()>,
}

impl PeerLink {
    pub fn new(config: LinkConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (signaling, inbound) = SignalingClient::new(config.timings.clone());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let engine = Engine::new(
            config.identity.clone(),
            config.glare,
            config.timings.clone(),
            Arc::clone(&signaling),
            SessionManager::new(factory, config.transport.clone()),
            snapshot_tx,
            events_tx.clone(),
        );
        let channels = EngineChannels {
            commands: commands_rx,
            inbound,
            status: signaling.subscribe_status(),
        };
        let engine = tokio::spawn(engine.run(channels));

        Self {
            config,
            signaling,
            commands: commands_tx,
            snapshot: snapshot_rx,
            events: events_tx,
            engine,
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Connects to the relay and keeps reconnecting in the background.
    ///
    /// A failed first attempt is reported but the watchdog keeps trying.
    pub async fn connect(&self) -> LinkResult<()> {
        self.signaling
            .start(&self.config.relay_url, &self.config.identity)
            .await
    }

    pub async fn initiate(&self, peer: &str) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Initiate {
            peer: peer.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| LinkError::EngineStopped)?
    }

    /// Sends `content` to the connected peer and returns the message as sent.
    pub async fn send(&self, content: &str) -> LinkResult<ChatMessage> {
        if self.current_state() != NegotiationState::Connected {
            return Err(LinkError::ChannelNotOpen);
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            content: content.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| LinkError::EngineStopped)?
    }

    /// Closes the session, keeping the relay connection.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Closes the session and the relay connection and halts reconnection.
    pub async fn full_disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::FullDisconnect { reply }).is_ok() {
            let _ = rx.await;
        } else {
            self.signaling.shutdown();
        }
    }

    pub fn current_state(&self) -> NegotiationState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.snapshot.borrow().role
    }

    pub fn peer(&self) -> Option<String> {
        self.snapshot.borrow().peer.clone()
    }

    pub fn signaling_status(&self) -> SignalingStatus {
        self.signaling.status()
    }

    /// Receives every event published after this call.
    ///
    /// Each receiver buffers up to `LinkConfig::event_capacity` events. A receiver that
    /// falls further behind gets `RecvError::Lagged(n)` and loses the `n` oldest events,
    /// received chat messages included. Session state itself is never lost: read it
    /// from [`PeerLink::watch_state`].
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn watch_signaling(&self) -> watch::Receiver<SignalingStatus> {
        self.signaling.subscribe_status()
    }

    fn command(&self, command: Command) -> LinkResult<()> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::EngineStopped)
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if self.engine.is_finished() {
            return;
        }
        // The engine drains on its own once the command channel closes.
        self.signaling.shutdown();
    }
}
