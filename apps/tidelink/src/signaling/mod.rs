//! Relay control channel: wire envelopes and the reconnecting client.

use serde::{Deserialize, Serialize};

use crate::transport::{IceCandidate, SessionDescription};

mod client;

pub use client::SignalingClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl SignalingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalingStatus::Disconnected => "disconnected",
            SignalingStatus::Connecting => "connecting",
            SignalingStatus::Connected => "connected",
            SignalingStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SignalingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Register,
    RegisterAck,
    RelayOpen,
    Offer,
    Answer,
    Candidate,
}

/// One JSON message on the control channel; `messageType` selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum SignalingEnvelope {
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "registration_success")]
    RegisterAck {
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(rename = "signaling_connected")]
    RelayOpen {},
    #[serde(rename = "webrtc_offer")]
    Offer {
        sender: String,
        to: String,
        sdp: SessionDescription,
    },
    #[serde(rename = "webrtc_answer")]
    Answer {
        sender: String,
        to: String,
        sdp: SessionDescription,
    },
    #[serde(rename = "webrtc_ice_candidate")]
    Candidate {
        sender: String,
        to: String,
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },
}

impl SignalingEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            SignalingEnvelope::Register { .. } => EnvelopeKind::Register,
            SignalingEnvelope::RegisterAck { .. } => EnvelopeKind::RegisterAck,
            SignalingEnvelope::RelayOpen {} => EnvelopeKind::RelayOpen,
            SignalingEnvelope::Offer { .. } => EnvelopeKind::Offer,
            SignalingEnvelope::Answer { .. } => EnvelopeKind::Answer,
            SignalingEnvelope::Candidate { .. } => EnvelopeKind::Candidate,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalingEnvelope::Register { user_id } => Some(user_id.as_str()),
            SignalingEnvelope::Offer { sender, .. }
            | SignalingEnvelope::Answer { sender, .. }
            | SignalingEnvelope::Candidate { sender, .. } => Some(sender.as_str()),
            SignalingEnvelope::RegisterAck { .. } | SignalingEnvelope::RelayOpen {} => None,
        }
    }

    /// Absent for kinds addressed to the relay itself.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalingEnvelope::Offer { to, .. }
            | SignalingEnvelope::Answer { to, .. }
            | SignalingEnvelope::Candidate { to, .. } => Some(to.as_str()),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
