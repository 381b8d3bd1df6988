//! Peer negotiation and session lifecycle over a WebSocket signaling relay.
//!
//! A [`PeerLink`] registers with the relay, drives the offer/answer/candidate exchange
//! against a pluggable [`transport::PeerTransport`], and exposes the resulting session
//! state plus a channel for chat messages.

pub mod cli;
pub mod config;
pub mod error;
pub mod link;
pub mod message;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::{GlarePolicy, LinkConfig, Timings, TransportConfig, TransportKind};
pub use error::{FailureReason, LinkError, LinkResult};
pub use link::PeerLink;
pub use message::{ChatMessage, Direction};
pub use negotiation::PeerEvent;
pub use session::{NegotiationState, Role, SessionSnapshot};
pub use signaling::{SignalingClient, SignalingEnvelope, SignalingStatus};
