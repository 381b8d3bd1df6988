use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("signaling relay did not acknowledge registration in time")]
    SignalingTimeout,
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("peer unavailable: {0}")]
    PeerOffline(String),
    #[error("negotiation with {peer} already in progress")]
    NegotiationBusy { peer: String },
    #[error("negotiation timed out")]
    NegotiationTimeout,
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("engine stopped")]
    EngineStopped,
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        LinkError::TransportFailure(err.to_string())
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Why a session ended up in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NegotiationTimeout,
    TransportFailure(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NegotiationTimeout => f.write_str("negotiation timed out"),
            FailureReason::TransportFailure(detail) => write!(f, "transport failure: {detail}"),
        }
    }
}

impl From<FailureReason> for LinkError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::NegotiationTimeout => LinkError::NegotiationTimeout,
            FailureReason::TransportFailure(detail) => LinkError::TransportFailure(detail),
        }
    }
}
