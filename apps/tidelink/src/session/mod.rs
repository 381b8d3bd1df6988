//! Single-session ownership: one transport handle at a time, closed before a new one
//! is created.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::transport::{
    IceCandidate, PeerTransport, TransportError, TransportEvent, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    CreatingOffer,
    AwaitingAnswer,
    CreatingAnswer,
    AwaitingConnection,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::CreatingOffer => "creating-offer",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::CreatingAnswer => "creating-answer",
            NegotiationState::AwaitingConnection => "awaiting-connection",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    /// True between the first offer/answer step and either Connected or Failed.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::CreatingOffer
                | NegotiationState::AwaitingAnswer
                | NegotiationState::CreatingAnswer
                | NegotiationState::AwaitingConnection
        )
    }

    /// Offer side states where an incoming offer from the same peer is glare.
    pub fn is_offering(self) -> bool {
        matches!(
            self,
            NegotiationState::CreatingOffer | NegotiationState::AwaitingAnswer
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the current session published to callers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub peer: Option<String>,
    pub role: Option<Role>,
    pub state: NegotiationState,
}

pub struct Session {
    pub generation: u64,
    pub peer: String,
    pub role: Role,
    pub state: NegotiationState,
    pub transport: Arc<dyn PeerTransport>,
    pub link_connected: bool,
    pub channel_open: bool,
    pub remote_applied: bool,
    /// Remote candidates received before the remote description was applied.
    pub pending_candidates: Vec<Option<IceCandidate>>,
    /// Set after a crossing offer was ignored; the peer's candidates until its answer
    /// belong to the attempt it abandoned.
    pub discard_remote_candidates: bool,
    timers: Vec<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    pub fn add_timer(&mut self, handle: JoinHandle<()>) {
        self.timers.retain(|timer| !timer.is_finished());
        self.timers.push(handle);
    }

    pub fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    /// Both halves of the link are up.
    pub fn is_established(&self) -> bool {
        self.link_connected && self.channel_open
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            generation: self.generation,
            peer: Some(self.peer.clone()),
            role: Some(self.role),
            state: self.state,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_timers();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

pub struct SessionManager {
    factory: Arc<dyn TransportFactory>,
    config: TransportConfig,
    current: Option<Session>,
    last_generation: u64,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: TransportConfig) -> Self {
        Self {
            factory,
            config,
            current: None,
            last_generation: 0,
        }
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    /// Returns the session only when it still carries `generation`.
    pub fn active_mut(&mut self, generation: u64) -> Option<&mut Session> {
        self.current
            .as_mut()
            .filter(|session| session.generation == generation)
    }

    pub fn last_generation(&self) -> u64 {
        self.last_generation
    }

    /// Replaces the current session with a fresh one for `peer`.
    ///
    /// The previous handle is closed before the factory is asked for a new one.
    /// `forward` receives the new generation and the handle's event stream, and returns
    /// the task that relays those events into the engine.
    pub async fn begin<F>(
        &mut self,
        peer: &str,
        role: Role,
        forward: F,
    ) -> Result<&mut Session, TransportError>
    where
        F: FnOnce(u64, mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()>,
    {
        self.teardown().await;

        self.last_generation += 1;
        let generation = self.last_generation;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(&self.config, events_tx).await?;
        let forwarder = forward(generation, events_rx);

        tracing::debug!(
            target = "tidelink::negotiation",
            generation,
            peer,
            %role,
            "session created"
        );
        Ok(self.current.insert(Session {
            generation,
            peer: peer.to_string(),
            role,
            state: NegotiationState::Idle,
            transport,
            link_connected: false,
            channel_open: false,
            remote_applied: false,
            pending_candidates: Vec::new(),
            discard_remote_candidates: false,
            timers: Vec::new(),
            forwarder: Some(forwarder),
        }))
    }

    /// Closes and drops the current session, if any. Returns whether one existed.
    pub async fn teardown(&mut self) -> bool {
        let Some(mut session) = self.current.take() else {
            return false;
        };
        session.cancel_timers();
        if let Some(forwarder) = session.forwarder.take() {
            forwarder.abort();
        }
        session.transport.close().await;
        tracing::debug!(
            target = "tidelink::negotiation",
            generation = session.generation,
            peer = %session.peer,
            "session torn down"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{SimNetwork, SimTransportFactory};

    fn idle_forwarder(
        _generation: u64,
        mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { while rx.recv().await.is_some() {} })
    }

    #[tokio::test]
    async fn begin_closes_previous_handle_first() {
        let network = SimNetwork::new();
        let factory = Arc::new(SimTransportFactory::new(Arc::clone(&network)));
        let mut manager = SessionManager::new(factory, TransportConfig::default());

        for peer in ["b", "c", "d"] {
            manager
                .begin(peer, Role::Initiator, idle_forwarder)
                .await
                .unwrap();
        }
        let stats = network.stats();
        assert_eq!(stats.created, 3);
        assert_eq!(stats.closed, 2);
        assert_eq!(stats.live, 1);
        assert_eq!(manager.current().map(|s| s.peer.as_str()), Some("d"));
        assert_eq!(manager.last_generation(), 3);

        assert!(manager.teardown().await);
        assert!(!manager.teardown().await);
        assert_eq!(network.stats().live, 0);
    }

    #[tokio::test]
    async fn stale_generation_is_not_active() {
        let factory = Arc::new(SimTransportFactory::new(SimNetwork::new()));
        let mut manager = SessionManager::new(factory, TransportConfig::default());
        let first = manager
            .begin("b", Role::Responder, idle_forwarder)
            .await
            .unwrap()
            .generation;
        manager.begin("b", Role::Initiator, idle_forwarder).await.unwrap();
        assert!(manager.active_mut(first).is_none());
        assert!(manager.active_mut(first + 1).is_some());
    }

    #[test]
    fn negotiating_states() {
        assert!(NegotiationState::AwaitingAnswer.is_negotiating());
        assert!(NegotiationState::AwaitingAnswer.is_offering());
        assert!(!NegotiationState::CreatingAnswer.is_offering());
        assert!(!NegotiationState::Connected.is_negotiating());
        assert!(!NegotiationState::Failed.is_negotiating());
    }
}
