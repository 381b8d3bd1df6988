use std::time::Duration;

use clap::ValueEnum;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9092/signaling";
pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Timer settings shared by the signaling client and the negotiation engine.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Upper bound for open + register + acknowledgment.
    pub register_timeout: Duration,
    /// Reconnect watchdog cadence.
    pub watchdog_interval: Duration,
    /// Single retry after a failed first connect.
    pub retry_delay: Duration,
    pub negotiation_timeout: Duration,
    pub failed_cooldown: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            register_timeout: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(3),
            negotiation_timeout: Duration::from_secs(15),
            failed_cooldown: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TransportKind {
    /// webrtc-rs peer connection
    #[default]
    Rtc,
    /// Deterministic in-process simulator
    Sim,
}

/// How an incoming offer is treated while our own offer to the same peer is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlarePolicy {
    /// The lexicographically smaller identity yields; the other keeps its offer.
    #[default]
    IdentityOrdered,
    /// Always abandon the local attempt and answer.
    ///
    /// When both sides use it and their offers truly cross, each answers an offer the
    /// other has already abandoned, so neither reaches Connected before the negotiation
    /// timeout. Only suitable when the remote side keeps its offer on collision.
    YieldToIncoming,
}

impl GlarePolicy {
    pub fn yields(self, local: &str, remote: &str) -> bool {
        match self {
            GlarePolicy::IdentityOrdered => local < remote,
            GlarePolicy::YieldToIncoming => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    if stun_disabled() {
        return Vec::new();
    }
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
        IceServer::turn(
            "turn:openrelay.metered.ca:80",
            "openrelayproject",
            "openrelayproject",
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443",
            "openrelayproject",
            "openrelayproject",
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443?transport=tcp",
            "openrelayproject",
            "openrelayproject",
        ),
    ]
}

fn stun_disabled() -> bool {
    crate::telemetry::env_truthy("TIDELINK_DISABLE_STUN").unwrap_or(false)
}

/// Configuration for the transport capability.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    pub ordered: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub relay_url: String,
    pub identity: String,
    pub transport: TransportConfig,
    pub glare: GlarePolicy,
    pub timings: Timings,
    /// Events buffered per subscriber before the slowest one starts lagging.
    pub event_capacity: usize,
}

impl LinkConfig {
    pub fn new(relay_url: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            identity: identity.into(),
            transport: TransportConfig::default(),
            glare: GlarePolicy::default(),
            timings: Timings::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_glare_policy(mut self, glare: GlarePolicy) -> Self {
        self.glare = glare;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_timings_match_protocol_constants() {
        let timings = Timings::default();
        assert_eq!(timings.register_timeout, Duration::from_secs(10));
        assert_eq!(timings.watchdog_interval, Duration::from_secs(5));
        assert_eq!(timings.retry_delay, Duration::from_secs(3));
        assert_eq!(timings.negotiation_timeout, Duration::from_secs(15));
        assert_eq!(timings.failed_cooldown, Duration::from_secs(3));
    }

    #[test]
    fn disable_stun_clears_ice_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var("TIDELINK_DISABLE_STUN").ok();

        unsafe {
            env::set_var("TIDELINK_DISABLE_STUN", "1");
        }
        assert!(default_ice_servers().is_empty());

        unsafe {
            env::remove_var("TIDELINK_DISABLE_STUN");
        }
        let servers = default_ice_servers();
        assert_eq!(servers.len(), 5);
        assert!(servers[0].urls[0].starts_with("stun:"));
        assert_eq!(servers[2].username.as_deref(), Some("openrelayproject"));

        unsafe {
            if let Some(orig) = original {
                env::set_var("TIDELINK_DISABLE_STUN", orig);
            }
        }
    }

    #[test]
    fn identity_ordered_glare_yields_exactly_one_side() {
        let policy = GlarePolicy::IdentityOrdered;
        assert!(policy.yields("alice", "bob"));
        assert!(!policy.yields("bob", "alice"));
        assert!(GlarePolicy::YieldToIncoming.yields("bob", "alice"));
    }

    #[test]
    fn yield_to_incoming_yields_on_both_sides() {
        let policy = GlarePolicy::YieldToIncoming;
        assert!(policy.yields("alice", "bob") && policy.yields("bob", "alice"));

        let ordered = GlarePolicy::IdentityOrdered;
        let yielding = [ordered.yields("alice", "bob"), ordered.yields("bob", "alice")];
        assert_eq!(yielding.iter().filter(|y| **y).count(), 1);
    }
}
