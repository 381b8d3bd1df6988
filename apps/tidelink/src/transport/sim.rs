//! Deterministic stand-in for a real peer connection.
//!
//! Endpoints find each other through a shared [`SimNetwork`] using a token embedded in
//! the SDP body, so two engines negotiating through a real relay end up linked exactly
//! when their offer/answer pair matches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    ChannelOptions, ConnectionState, IceCandidate, PeerTransport, SdpKind, SessionDescription,
    TransportError, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::config::TransportConfig;

const TOKEN_ATTRIBUTE: &str = "a=x-tidelink-sim:";
const GATHERED_CANDIDATES: usize = 2;

#[derive(Debug, Clone)]
pub struct SimTimings {
    pub candidate_interval: Duration,
    pub gathering_tail: Duration,
    pub connect_delay: Duration,
    /// Data-channel-open fallback after the link comes up.
    pub channel_open_delay: Duration,
}

impl Default for SimTimings {
    fn default() -> Self {
        Self {
            candidate_interval: Duration::from_millis(300),
            gathering_tail: Duration::from_millis(500),
            connect_delay: Duration::from_millis(1000),
            channel_open_delay: Duration::from_millis(2000),
        }
    }
}

impl SimTimings {
    pub fn fast() -> Self {
        Self {
            candidate_interval: Duration::from_millis(5),
            gathering_tail: Duration::from_millis(10),
            connect_delay: Duration::from_millis(20),
            channel_open_delay: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub created: usize,
    pub closed: usize,
    pub live: usize,
    pub candidates_added: usize,
    pub end_of_candidates: usize,
}

#[derive(Default)]
pub struct SimNetwork {
    endpoints: Mutex<HashMap<String, Weak<SimEndpoint>>>,
    link_lock: Mutex<()>,
    created: AtomicUsize,
    closed: AtomicUsize,
    candidates_added: AtomicUsize,
    end_of_candidates: AtomicUsize,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self) -> SimStats {
        let created = self.created.load(Ordering::SeqCst);
        let closed = self.closed.load(Ordering::SeqCst);
        SimStats {
            created,
            closed,
            live: created.saturating_sub(closed),
            candidates_added: self.candidates_added.load(Ordering::SeqCst),
            end_of_candidates: self.end_of_candidates.load(Ordering::SeqCst),
        }
    }

    /// Reports a link failure on every live endpoint.
    pub fn fail_all(&self) {
        for endpoint in self.live_endpoints() {
            endpoint.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
        }
    }

    fn live_endpoints(&self) -> Vec<Arc<SimEndpoint>> {
        self.endpoints
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn lookup(&self, token: &str) -> Option<Arc<SimEndpoint>> {
        self.endpoints.lock().get(token).and_then(Weak::upgrade)
    }
}

pub struct SimTransportFactory {
    network: Arc<SimNetwork>,
    timings: SimTimings,
}

impl SimTransportFactory {
    pub fn new(network: Arc<SimNetwork>) -> Self {
        Self {
            network,
            timings: SimTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: SimTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn network(&self) -> Arc<SimNetwork> {
        Arc::clone(&self.network)
    }
}

#[async_trait]
impl TransportFactory for SimTransportFactory {
    async fn create(
        &self,
        _config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let endpoint = Arc::new(SimEndpoint {
            token: Uuid::new_v4().simple().to_string(),
            network: Arc::clone(&self.network),
            timings: self.timings.clone(),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        self.network
            .endpoints
            .lock()
            .insert(endpoint.token.clone(), Arc::downgrade(&endpoint));
        self.network.created.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(target = "tidelink::transport", token = %endpoint.token, "sim endpoint created");
        Ok(Arc::new(SimTransport { endpoint }))
    }
}

#[derive(Default)]
struct EndpointState {
    local: Option<SessionDescription>,
    remote_token: Option<String>,
    gathering: bool,
    linked: bool,
    channel_open: bool,
    closed: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct SimEndpoint {
    token: String,
    network: Arc<SimNetwork>,
    timings: SimTimings,
    events: TransportEventSink,
    state: Mutex<EndpointState>,
}

impl SimEndpoint {
    fn emit(&self, event: TransportEvent) {
        if self.state.lock().closed {
            return;
        }
        let _ = self.events.send(event);
    }

    fn schedule<F>(self: &Arc<Self>, delay: Duration, action: F)
    where
        F: FnOnce(&SimEndpoint) + Send + 'static,
    {
        let endpoint = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action(&endpoint);
        });
        let mut state = self.state.lock();
        if state.closed {
            handle.abort();
        } else {
            state.tasks.push(handle);
        }
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let setup = match kind {
            SdpKind::Offer => "actpass",
            SdpKind::Answer => "active",
        };
        let sdp = format!(
            "v=0\r\no=- {token} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\nc=IN IP4 0.0.0.0\r\n\
             a=setup:{setup}\r\na=mid:0\r\na=sctp-port:5000\r\n{TOKEN_ATTRIBUTE}{token}\r\n",
            token = self.token,
        );
        SessionDescription { kind, sdp }
    }

    fn start_gathering(self: &Arc<Self>) {
        for index in 0..GATHERED_CANDIDATES {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp {} 10.0.{}.1 {} typ host",
                    842163049 + index,
                    1677721855 - index * 256,
                    index,
                    54400 + index
                ),
                sdp_mline_index: Some(0),
                sdp_mid: Some("0".into()),
            };
            let delay = self.timings.candidate_interval * (index as u32 + 1);
            self.schedule(delay, move |endpoint| {
                endpoint.emit(TransportEvent::CandidateGenerated(Some(candidate)));
            });
        }
        let tail = self.timings.candidate_interval * GATHERED_CANDIDATES as u32
            + self.timings.gathering_tail;
        self.schedule(tail, |endpoint| {
            endpoint.emit(TransportEvent::CandidateGenerated(None));
        });
    }

    fn ready_for(&self, remote: &str) -> bool {
        let state = self.state.lock();
        !state.closed
            && !state.linked
            && state.local.is_some()
            && state.remote_token.as_deref() == Some(remote)
    }

    /// Links with the counterpart once both sides hold both descriptions.
    fn try_link(self: &Arc<Self>) {
        let remote_token = {
            let state = self.state.lock();
            match (&state.local, &state.remote_token) {
                (Some(_), Some(token)) if !state.linked && !state.closed => token.clone(),
                _ => return,
            }
        };
        let Some(peer) = self.network.lookup(&remote_token) else {
            return;
        };

        let _link = self.network.link_lock.lock();
        if !self.ready_for(&remote_token) || !peer.ready_for(&self.token) {
            return;
        }
        self.state.lock().linked = true;
        peer.state.lock().linked = true;
        tracing::debug!(
            target = "tidelink::transport",
            local = %self.token,
            remote = %peer.token,
            "sim endpoints linked"
        );
        for endpoint in [self, &peer] {
            let connect = endpoint.timings.connect_delay;
            endpoint.schedule(connect, |endpoint| {
                endpoint.emit(TransportEvent::ConnectionStateChanged(
                    ConnectionState::Connected,
                ));
            });
            let open = connect + endpoint.timings.channel_open_delay;
            endpoint.schedule(open, |endpoint| {
                let opened = {
                    let mut state = endpoint.state.lock();
                    if state.closed {
                        false
                    } else {
                        state.channel_open = true;
                        true
                    }
                };
                if opened {
                    endpoint.emit(TransportEvent::ChannelOpened);
                }
            });
        }
    }

    fn counterpart(&self) -> Option<Arc<SimEndpoint>> {
        let token = self.state.lock().remote_token.clone()?;
        self.network.lookup(&token)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

pub struct SimTransport {
    endpoint: Arc<SimEndpoint>,
}

impl SimTransport {
    pub fn token(&self) -> &str {
        &self.endpoint.token
    }
}

fn token_from_sdp(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(TOKEN_ATTRIBUTE))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl PeerTransport for SimTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.endpoint.ensure_open()?;
        Ok(self.endpoint.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.endpoint.ensure_open()?;
        if self.endpoint.state.lock().remote_token.is_none() {
            return Err(TransportError::OutOfOrder("answer requested before remote offer"));
        }
        Ok(self.endpoint.describe(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.endpoint.ensure_open()?;
        let start_gathering = {
            let mut state = self.endpoint.state.lock();
            state.local = Some(desc);
            !std::mem::replace(&mut state.gathering, true)
        };
        if start_gathering {
            self.endpoint
                .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connecting));
            self.endpoint.start_gathering();
        }
        self.endpoint.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.endpoint.ensure_open()?;
        let token = token_from_sdp(&desc.sdp).ok_or_else(|| {
            TransportError::InvalidDescription("missing simulator endpoint token".into())
        })?;
        self.endpoint.state.lock().remote_token = Some(token);
        self.endpoint.try_link();
        Ok(())
    }

    async fn add_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), TransportError> {
        self.endpoint.ensure_open()?;
        if self.endpoint.state.lock().remote_token.is_none() {
            return Err(TransportError::OutOfOrder(
                "candidate added before remote description",
            ));
        }
        let network = &self.endpoint.network;
        match candidate {
            Some(_) => network.candidates_added.fetch_add(1, Ordering::SeqCst),
            None => network.end_of_candidates.fetch_add(1, Ordering::SeqCst),
        };
        Ok(())
    }

    async fn create_channel(
        &self,
        label: &str,
        opts: ChannelOptions,
    ) -> Result<(), TransportError> {
        self.endpoint.ensure_open()?;
        tracing::trace!(
            target = "tidelink::transport",
            token = %self.endpoint.token,
            label,
            ordered = opts.ordered,
            "sim data channel requested"
        );
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.endpoint.ensure_open()?;
        if !self.endpoint.state.lock().channel_open {
            return Err(TransportError::ChannelNotOpen);
        }
        let peer = self.endpoint.counterpart().ok_or(TransportError::Closed)?;
        peer.ensure_open()?;
        peer.emit(TransportEvent::MessageReceived(payload));
        Ok(())
    }

    async fn close(&self) {
        let (tasks, linked) = {
            let mut state = self.endpoint.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.channel_open = false;
            (std::mem::take(&mut state.tasks), state.linked)
        };
        for task in tasks {
            task.abort();
        }
        let network = &self.endpoint.network;
        network.endpoints.lock().remove(&self.endpoint.token);
        network.closed.fetch_add(1, Ordering::SeqCst);
        if linked {
            if let Some(peer) = self.endpoint.counterpart() {
                peer.emit(TransportEvent::ChannelClosed);
            }
        }
        tracing::trace!(target = "tidelink::transport", token = %self.endpoint.token, "sim endpoint closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<TransportEvent>, mut pred: F)
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return;
            }
        }
    }

    #[test]
    fn token_is_read_back_from_sdp() {
        let sdp = "v=0\r\na=mid:0\r\na=x-tidelink-sim:abc123\r\n";
        assert_eq!(token_from_sdp(sdp).as_deref(), Some("abc123"));
        assert_eq!(token_from_sdp("v=0\r\n"), None);
    }

    #[tokio::test]
    async fn linked_endpoints_open_and_exchange_bytes() {
        let network = SimNetwork::new();
        let factory = SimTransportFactory::new(Arc::clone(&network)).with_timings(SimTimings::fast());
        let config = TransportConfig::default();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = factory.create(&config, a_tx).await.unwrap();
        let b = factory.create(&config, b_tx).await.unwrap();

        a.create_channel("chat", ChannelOptions { ordered: true }).await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        wait_for(&mut a_rx, |e| matches!(e, TransportEvent::ChannelOpened)).await;
        wait_for(&mut b_rx, |e| matches!(e, TransportEvent::ChannelOpened)).await;

        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();
        let mut received = Vec::new();
        while received.len() < 2 {
            if let TransportEvent::MessageReceived(bytes) = next_event(&mut b_rx).await {
                received.push(bytes);
            }
        }
        assert_eq!(received, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        b.close().await;
        wait_for(&mut a_rx, |e| matches!(e, TransportEvent::ChannelClosed)).await;
        a.close().await;
        a.close().await;
        let stats = network.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.closed, 2);
        assert_eq!(stats.live, 0);
    }

    #[tokio::test]
    async fn gathering_ends_with_end_of_candidates() {
        let network = SimNetwork::new();
        let factory = SimTransportFactory::new(network).with_timings(SimTimings::fast());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = factory.create(&TransportConfig::default(), tx).await.unwrap();
        let offer = transport.create_offer().await.unwrap();
        transport.set_local_description(offer).await.unwrap();

        let mut gathered = Vec::new();
        loop {
            match next_event(&mut rx).await {
                TransportEvent::CandidateGenerated(Some(candidate)) => gathered.push(candidate),
                TransportEvent::CandidateGenerated(None) => break,
                _ => {}
            }
        }
        assert_eq!(gathered.len(), GATHERED_CANDIDATES);
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let factory = SimTransportFactory::new(SimNetwork::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(&TransportConfig::default(), tx).await.unwrap();
        assert!(matches!(
            transport.create_answer().await,
            Err(TransportError::OutOfOrder(_))
        ));
        assert!(matches!(
            transport.add_candidate(None).await,
            Err(TransportError::OutOfOrder(_))
        ));
        assert!(matches!(
            transport.send(Bytes::from_static(b"x")).await,
            Err(TransportError::ChannelNotOpen)
        ));
        transport.close().await;
        assert!(matches!(
            transport.create_offer().await,
            Err(TransportError::Closed)
        ));
    }
}
