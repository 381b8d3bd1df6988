#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tidelink::transport::sim::{SimNetwork, SimTimings, SimTransportFactory};
use tidelink::{
    LinkConfig, NegotiationState, PeerEvent, PeerLink, SignalingStatus, Timings,
};
use tidelink_relay::{build_router, RelayState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

pub struct Harness {
    pub addr: SocketAddr,
    pub url: String,
    pub relay: RelayState,
    pub network: Arc<SimNetwork>,
}

pub fn fast_timings() -> Timings {
    Timings {
        register_timeout: Duration::from_secs(2),
        watchdog_interval: Duration::from_millis(200),
        retry_delay: Duration::from_millis(100),
        negotiation_timeout: Duration::from_secs(2),
        failed_cooldown: Duration::from_millis(300),
    }
}

impl Harness {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = RelayState::new();
        let app = build_router(relay.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            url: format!("ws://{addr}/signaling"),
            relay,
            network: SimNetwork::new(),
        }
    }

    pub fn link_with(&self, identity: &str, timings: Timings) -> PeerLink {
        self.link_at(&self.url, identity, timings)
    }

    /// A link on this harness's simulated network that reaches the relay through `url`.
    pub fn link_at(&self, url: &str, identity: &str, timings: Timings) -> PeerLink {
        self.link_from(LinkConfig::new(url, identity).with_timings(timings))
    }

    pub fn link_from(&self, config: LinkConfig) -> PeerLink {
        let factory = SimTransportFactory::new(Arc::clone(&self.network))
            .with_timings(SimTimings::fast());
        PeerLink::new(config, Arc::new(factory))
    }

    pub async fn connected_with(&self, identity: &str, timings: Timings) -> PeerLink {
        let link = self.link_with(identity, timings);
        link.connect().await.expect("relay registration");
        assert_eq!(link.signaling_status(), SignalingStatus::Connected);
        link
    }

    pub async fn connected(&self, identity: &str) -> PeerLink {
        self.connected_with(identity, fast_timings()).await
    }
}

pub async fn wait_for_state(link: &PeerLink, state: NegotiationState, within: Duration) {
    let mut rx = link.watch_state();
    let reached = tokio::time::timeout(within, async {
        loop {
            if rx.borrow_and_update().state == state {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(
        reached.is_ok() && link.current_state() == state,
        "{} did not reach {state} (now {})",
        link.identity(),
        link.current_state()
    );
}

pub async fn wait_for_signaling(link: &PeerLink, status: SignalingStatus, within: Duration) {
    let mut rx = link.watch_signaling();
    let reached = tokio::time::timeout(within, async {
        loop {
            if *rx.borrow_and_update() == status {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(
        reached.is_ok() && link.signaling_status() == status,
        "{} signaling did not reach {status}",
        link.identity()
    );
}

pub async fn next_matching<F>(
    rx: &mut broadcast::Receiver<PeerEvent>,
    within: Duration,
    mut pred: F,
) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Polls `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// TCP forwarder that holds every accepted connection for `delay` before dialing `target`.
pub async fn delaying_proxy(target: SocketAddr, delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Ok(mut outbound) = TcpStream::connect(target).await else {
                    return;
                };
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            });
        }
    });
    addr
}
