//! Peer transport capability consumed by the negotiation engine.
//!
//! The engine never touches a concrete peer connection. It asks a
//! [`TransportFactory`] for a fresh [`PeerTransport`] per session and listens to the
//! [`TransportEvent`]s that handle pushes into the sink it was created with.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{TransportConfig, TransportKind};

pub mod rtc;
pub mod sim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    /// An empty candidate string is the legacy spelling of end-of-candidates.
    pub fn normalize(candidate: Option<IceCandidate>) -> Option<IceCandidate> {
        candidate.filter(|c| !c.candidate.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub ordered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// `None` marks end-of-candidates.
    CandidateGenerated(Option<IceCandidate>),
    ConnectionStateChanged(ConnectionState),
    ChannelOpened,
    MessageReceived(Bytes),
    ChannelClosed,
}

pub type TransportEventSink = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("operation out of order: {0}")]
    OutOfOrder(&'static str),
    #[error("data channel not open")]
    ChannelNotOpen,
    #[error("transport closed")]
    Closed,
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

/// One peer connection; handles are single-use and closed when their session ends.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    /// `None` signals end-of-candidates.
    async fn add_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), TransportError>;

    async fn create_channel(&self, label: &str, opts: ChannelOptions)
    -> Result<(), TransportError>;

    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Best-effort and idempotent; no events are emitted afterwards.
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Picks the capability implementation at configuration time.
pub fn factory_for(kind: TransportKind) -> Arc<dyn TransportFactory> {
    match kind {
        TransportKind::Rtc => Arc::new(rtc::RtcTransportFactory::new()),
        TransportKind::Sim => Arc::new(sim::SimTransportFactory::new(sim::SimNetwork::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_candidate_normalizes_to_end_of_candidates() {
        let empty = IceCandidate {
            candidate: "  ".into(),
            sdp_mline_index: Some(0),
            sdp_mid: None,
        };
        assert!(IceCandidate::normalize(Some(empty)).is_none());
        assert!(IceCandidate::normalize(None).is_none());

        let real = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mline_index: Some(0),
            sdp_mid: Some("0".into()),
        };
        assert_eq!(IceCandidate::normalize(Some(real.clone())), Some(real));
    }

    #[test]
    fn description_uses_type_field() {
        let desc = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0".into(),
        };
        let text = serde_json::to_string(&desc).unwrap();
        assert_eq!(text, r#"{"type":"answer","sdp":"v=0"}"#);
    }
}
