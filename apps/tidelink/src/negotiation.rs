//! The negotiation engine: a single task that owns the session and serialises every
//! event touching it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{GlarePolicy, Timings};
use crate::error::{FailureReason, LinkError, LinkResult};
use crate::message::ChatMessage;
use crate::session::{NegotiationState, Role, SessionManager, SessionSnapshot};
use crate::signaling::{SignalingClient, SignalingEnvelope, SignalingStatus};
use crate::transport::{
    ChannelOptions, ConnectionState, IceCandidate, PeerTransport, SessionDescription,
    TransportError, TransportEvent,
};

/// Notifications delivered to subscribers of a [`crate::PeerLink`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged {
        peer: Option<String>,
        state: NegotiationState,
    },
    SignalingChanged(SignalingStatus),
    MessageReceived(ChatMessage),
    NegotiationFailed {
        peer: String,
        reason: FailureReason,
    },
}

pub(crate) enum Command {
    Initiate {
        peer: String,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Send {
        content: String,
        reply: oneshot::Sender<LinkResult<ChatMessage>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    FullDisconnect {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    NegotiationTimeout {
        generation: u64,
    },
    CooldownElapsed {
        generation: u64,
    },
}

pub(crate) struct EngineChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    pub status: watch::Receiver<SignalingStatus>,
}

pub(crate) struct Engine {
    identity: String,
    glare: GlarePolicy,
    timings: Timings,
    signaling: Arc<SignalingClient>,
    sessions: SessionManager,
    /// State reported while no session exists: `Idle` or `Closed`.
    resting: NegotiationState,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<PeerEvent>,
}

fn transport_failure(err: TransportError) -> FailureReason {
    FailureReason::TransportFailure(err.to_string())
}

fn relay_failure(err: LinkError) -> FailureReason {
    FailureReason::TransportFailure(format!("relay unavailable: {err}"))
}

fn spawn_forwarder(
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    tx: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if tx.send(Internal::Transport { generation, event }).is_err() {
                break;
            }
        }
    })
}

impl Engine {
    pub(crate) fn new(
        identity: String,
        glare: GlarePolicy,
        timings: Timings,
        signaling: Arc<SignalingClient>,
        sessions: SessionManager,
        snapshot_tx: watch::Sender<SessionSnapshot>,
        events_tx: broadcast::Sender<PeerEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            glare,
            timings,
            signaling,
            sessions,
            resting: NegotiationState::Idle,
            internal_tx,
            internal_rx: Some(internal_rx),
            snapshot_tx,
            events_tx,
        }
    }

    pub(crate) async fn run(mut self, mut channels: EngineChannels) {
        let Some(mut internal) = self.internal_rx.take() else {
            return;
        };
        loop {
            tokio::select! {
                command = channels.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(envelope) = channels.inbound.recv() => self.handle_envelope(envelope).await,
                Some(event) = internal.recv() => self.handle_internal(event).await,
                Ok(()) = channels.status.changed() => {
                    let status = *channels.status.borrow_and_update();
                    let _ = self.events_tx.send(PeerEvent::SignalingChanged(status));
                }
            }
        }
        self.sessions.teardown().await;
        self.signaling.shutdown();
        tracing::debug!(target = "tidelink::negotiation", identity = %self.identity, "engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate { peer, reply } => {
                let result = self.initiate(peer).await;
                let _ = reply.send(result);
            }
            Command::Send { content, reply } => {
                let result = self.send_message(content).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::FullDisconnect { reply } => {
                self.disconnect().await;
                self.signaling.shutdown();
                let _ = reply.send(());
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        if let Some(to) = envelope.recipient() {
            if to != self.identity {
                tracing::debug!(
                    target = "tidelink::negotiation",
                    to,
                    kind = ?envelope.kind(),
                    "ignoring envelope addressed elsewhere"
                );
                return;
            }
        }
        match envelope {
            SignalingEnvelope::Offer { sender, sdp, .. } => self.on_offer(sender, sdp).await,
            SignalingEnvelope::Answer { sender, sdp, .. } => self.on_answer(sender, sdp).await,
            SignalingEnvelope::Candidate {
                sender, candidate, ..
            } => self.on_remote_candidate(sender, candidate).await,
            _ => {}
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Transport { generation, event } => {
                self.on_transport_event(generation, event).await
            }
            Internal::NegotiationTimeout { generation } => {
                let negotiating = self
                    .sessions
                    .active_mut(generation)
                    .is_some_and(|session| session.state.is_negotiating());
                if negotiating {
                    tracing::warn!(
                        target = "tidelink::negotiation",
                        generation,
                        "negotiation timed out"
                    );
                    self.fail(generation, FailureReason::NegotiationTimeout);
                }
            }
            Internal::CooldownElapsed { generation } => {
                let failed = self
                    .sessions
                    .active_mut(generation)
                    .is_some_and(|session| session.state == NegotiationState::Failed);
                if failed {
                    self.sessions.teardown().await;
                    self.resting = NegotiationState::Idle;
                    self.publish();
                }
            }
        }
    }

    async fn initiate(&mut self, peer: String) -> LinkResult<()> {
        if peer.trim().is_empty() || peer == self.identity {
            return Err(LinkError::PeerOffline(peer));
        }
        if self.signaling.status() != SignalingStatus::Connected {
            return Err(LinkError::NotConnected);
        }
        if let Some(session) = self.sessions.current() {
            let live = session.state.is_negotiating() || session.state == NegotiationState::Connected;
            if session.state.is_negotiating() && session.peer != peer {
                return Err(LinkError::NegotiationBusy {
                    peer: session.peer.clone(),
                });
            }
            if live && session.peer == peer {
                tracing::debug!(
                    target = "tidelink::negotiation",
                    %peer,
                    state = %session.state,
                    "session with peer already underway"
                );
                return Ok(());
            }
        }

        let (generation, transport) = self.open_session(&peer, Role::Initiator).await?;
        tracing::info!(target = "tidelink::negotiation", %peer, generation, "initiating session");
        self.enter(generation, NegotiationState::CreatingOffer);
        self.arm_timer(generation, self.timings.negotiation_timeout, |generation| {
            Internal::NegotiationTimeout { generation }
        });

        match self.send_offer(&peer, transport).await {
            Ok(()) => {
                self.enter(generation, NegotiationState::AwaitingAnswer);
                Ok(())
            }
            Err(reason) => {
                self.fail(generation, reason.clone());
                Err(reason.into())
            }
        }
    }

    async fn send_offer(
        &self,
        peer: &str,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(), FailureReason> {
        let config = self.sessions.transport_config();
        transport
            .create_channel(
                &config.channel_label,
                ChannelOptions {
                    ordered: config.ordered,
                },
            )
            .await
            .map_err(transport_failure)?;
        let offer = transport.create_offer().await.map_err(transport_failure)?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(transport_failure)?;
        self.signaling
            .send(&SignalingEnvelope::Offer {
                sender: self.identity.clone(),
                to: peer.to_string(),
                sdp: offer,
            })
            .map_err(relay_failure)
    }

    async fn on_offer(&mut self, peer: String, sdp: SessionDescription) {
        if let Some(session) = self.sessions.current_mut() {
            if session.peer == peer && session.state.is_offering() {
                if !self.glare.yields(&self.identity, &peer) {
                    tracing::info!(
                        target = "tidelink::negotiation",
                        %peer,
                        "offer collision: keeping local offer"
                    );
                    session.pending_candidates.clear();
                    session.discard_remote_candidates = true;
                    return;
                }
                tracing::info!(
                    target = "tidelink::negotiation",
                    %peer,
                    "offer collision: yielding to remote offer"
                );
            }
        }

        let (generation, transport) = match self.open_session(&peer, Role::Responder).await {
            Ok(opened) => opened,
            Err(err) => {
                tracing::warn!(target = "tidelink::negotiation", %peer, error = %err, "cannot answer offer");
                return;
            }
        };
        tracing::info!(target = "tidelink::negotiation", %peer, generation, "answering offer");
        self.enter(generation, NegotiationState::CreatingAnswer);
        self.arm_timer(generation, self.timings.negotiation_timeout, |generation| {
            Internal::NegotiationTimeout { generation }
        });

        match self.send_answer(generation, &peer, transport, sdp).await {
            Ok(()) => {
                self.enter(generation, NegotiationState::AwaitingConnection);
                self.check_established(generation);
            }
            Err(reason) => self.fail(generation, reason),
        }
    }

    async fn send_answer(
        &mut self,
        generation: u64,
        peer: &str,
        transport: Arc<dyn PeerTransport>,
        offer: SessionDescription,
    ) -> Result<(), FailureReason> {
        transport
            .set_remote_description(offer)
            .await
            .map_err(transport_failure)?;
        self.flush_pending(generation, &transport).await;
        let answer = transport.create_answer().await.map_err(transport_failure)?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(transport_failure)?;
        self.signaling
            .send(&SignalingEnvelope::Answer {
                sender: self.identity.clone(),
                to: peer.to_string(),
                sdp: answer,
            })
            .map_err(relay_failure)
    }

    async fn on_answer(&mut self, peer: String, sdp: SessionDescription) {
        let Some(session) = self.sessions.current().filter(|session| {
            session.peer == peer
                && session.role == Role::Initiator
                && session.state == NegotiationState::AwaitingAnswer
        }) else {
            tracing::debug!(target = "tidelink::negotiation", %peer, "ignoring unexpected answer");
            return;
        };
        let generation = session.generation;
        let transport = Arc::clone(&session.transport);

        if let Err(err) = transport.set_remote_description(sdp).await {
            self.fail(generation, transport_failure(err));
            return;
        }
        self.flush_pending(generation, &transport).await;
        self.enter(generation, NegotiationState::AwaitingConnection);
        self.check_established(generation);
    }

    async fn on_remote_candidate(&mut self, peer: String, candidate: Option<IceCandidate>) {
        let candidate = IceCandidate::normalize(candidate);
        let Some(session) = self.sessions.current_mut().filter(|session| {
            session.peer == peer
                && !matches!(
                    session.state,
                    NegotiationState::Closed | NegotiationState::Failed
                )
        }) else {
            tracing::trace!(target = "tidelink::negotiation", %peer, "dropping candidate without session");
            return;
        };
        if session.discard_remote_candidates {
            tracing::debug!(target = "tidelink::negotiation", %peer, "dropping candidate from abandoned offer");
            return;
        }
        if !session.remote_applied {
            session.pending_candidates.push(candidate);
            return;
        }
        let transport = Arc::clone(&session.transport);
        if let Err(err) = transport.add_candidate(candidate).await {
            tracing::warn!(target = "tidelink::negotiation", %peer, error = %err, "failed to add remote candidate");
        }
    }

    async fn flush_pending(&mut self, generation: u64, transport: &Arc<dyn PeerTransport>) {
        let pending = match self.sessions.active_mut(generation) {
            Some(session) => {
                session.remote_applied = true;
                session.discard_remote_candidates = false;
                std::mem::take(&mut session.pending_candidates)
            }
            None => return,
        };
        if !pending.is_empty() {
            tracing::debug!(
                target = "tidelink::negotiation",
                generation,
                count = pending.len(),
                "flushing buffered candidates"
            );
        }
        for candidate in pending {
            if let Err(err) = transport.add_candidate(candidate).await {
                tracing::warn!(target = "tidelink::negotiation", error = %err, "failed to add buffered candidate");
            }
        }
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        let Some(session) = self.sessions.active_mut(generation) else {
            return;
        };
        if matches!(
            session.state,
            NegotiationState::Failed | NegotiationState::Closed
        ) {
            return;
        }
        let state = session.state;
        match event {
            TransportEvent::CandidateGenerated(candidate) => {
                let envelope = SignalingEnvelope::Candidate {
                    sender: self.identity.clone(),
                    to: session.peer.clone(),
                    candidate,
                };
                if self.signaling.status() == SignalingStatus::Connected {
                    let _ = self.signaling.send(&envelope);
                } else {
                    tracing::debug!(target = "tidelink::negotiation", generation, "relay down, local candidate dropped");
                }
            }
            TransportEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                session.link_connected = true;
                self.check_established(generation);
            }
            TransportEvent::ChannelOpened => {
                session.channel_open = true;
                self.check_established(generation);
            }
            TransportEvent::ConnectionStateChanged(ConnectionState::Failed) => {
                self.fail(generation, FailureReason::TransportFailure("link failed".into()));
            }
            TransportEvent::ConnectionStateChanged(ConnectionState::Closed)
            | TransportEvent::ChannelClosed => {
                if state == NegotiationState::Connected {
                    tracing::info!(target = "tidelink::negotiation", generation, "peer closed the session");
                    self.sessions.teardown().await;
                    self.resting = NegotiationState::Closed;
                    self.publish();
                } else {
                    self.fail(
                        generation,
                        FailureReason::TransportFailure("channel closed during negotiation".into()),
                    );
                }
            }
            TransportEvent::ConnectionStateChanged(other) => {
                tracing::trace!(target = "tidelink::transport", generation, state = ?other, "link state");
            }
            TransportEvent::MessageReceived(bytes) => {
                if state != NegotiationState::Connected {
                    tracing::debug!(target = "tidelink::negotiation", generation, "message before connected dropped");
                    return;
                }
                match ChatMessage::decode_inbound(&bytes) {
                    Ok(message) => {
                        let _ = self.events_tx.send(PeerEvent::MessageReceived(message));
                    }
                    Err(err) => {
                        tracing::warn!(target = "tidelink::negotiation", error = %err, "undecodable channel message");
                    }
                }
            }
        }
    }

    fn check_established(&mut self, generation: u64) {
        let Some(session) = self.sessions.active_mut(generation) else {
            return;
        };
        if session.state != NegotiationState::AwaitingConnection || !session.is_established() {
            return;
        }
        session.cancel_timers();
        tracing::info!(
            target = "tidelink::negotiation",
            peer = %session.peer,
            role = %session.role,
            generation,
            "session connected"
        );
        self.enter(generation, NegotiationState::Connected);
    }

    async fn send_message(&mut self, content: String) -> LinkResult<ChatMessage> {
        let Some(session) = self
            .sessions
            .current()
            .filter(|session| session.state == NegotiationState::Connected)
        else {
            return Err(LinkError::ChannelNotOpen);
        };
        let transport = Arc::clone(&session.transport);
        let message = ChatMessage::outgoing(&self.identity, &content);
        let payload = Bytes::from(message.encode()?);
        transport.send(payload).await.map_err(|err| match err {
            TransportError::ChannelNotOpen => LinkError::ChannelNotOpen,
            other => other.into(),
        })?;
        Ok(message)
    }

    async fn disconnect(&mut self) {
        if self.sessions.teardown().await {
            self.resting = NegotiationState::Closed;
            self.publish();
        }
    }

    async fn open_session(
        &mut self,
        peer: &str,
        role: Role,
    ) -> LinkResult<(u64, Arc<dyn PeerTransport>)> {
        let internal = self.internal_tx.clone();
        let opened = self
            .sessions
            .begin(peer, role, move |generation, rx| {
                spawn_forwarder(generation, rx, internal)
            })
            .await
            .map(|session| (session.generation, Arc::clone(&session.transport)));
        match opened {
            Ok(opened) => Ok(opened),
            Err(err) => {
                // The previous session is already gone.
                self.resting = NegotiationState::Idle;
                self.publish();
                Err(err.into())
            }
        }
    }

    fn enter(&mut self, generation: u64, state: NegotiationState) {
        if let Some(session) = self.sessions.active_mut(generation) {
            session.state = state;
        }
        self.publish();
    }

    fn fail(&mut self, generation: u64, reason: FailureReason) {
        let Some(session) = self.sessions.active_mut(generation) else {
            return;
        };
        session.cancel_timers();
        session.state = NegotiationState::Failed;
        let peer = session.peer.clone();
        tracing::warn!(target = "tidelink::negotiation", %peer, generation, %reason, "session failed");
        self.publish();
        let _ = self
            .events_tx
            .send(PeerEvent::NegotiationFailed { peer, reason });
        self.arm_timer(generation, self.timings.failed_cooldown, |generation| {
            Internal::CooldownElapsed { generation }
        });
    }

    fn arm_timer<F>(&mut self, generation: u64, delay: Duration, event: F)
    where
        F: FnOnce(u64) -> Internal + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let Some(session) = self.sessions.active_mut(generation) else {
            return;
        };
        session.add_timer(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event(generation));
        }));
    }

    fn publish(&mut self) {
        let snapshot = match self.sessions.current() {
            Some(session) => session.snapshot(),
            None => SessionSnapshot {
                generation: self.sessions.last_generation(),
                peer: None,
                role: None,
                state: self.resting,
            },
        };
        let mut notify = None;
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            if current.state != snapshot.state || current.peer != snapshot.peer {
                notify = Some(PeerEvent::StateChanged {
                    peer: snapshot.peer.clone(),
                    state: snapshot.state,
                });
            }
            *current = snapshot;
            true
        });
        if let Some(event) = notify {
            tracing::debug!(target = "tidelink::negotiation", ?event, "state published");
            let _ = self.events_tx.send(event);
        }
    }
}
