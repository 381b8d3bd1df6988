use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock as AsyncRwLock;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ChannelOptions, ConnectionState, IceCandidate, PeerTransport, SdpKind, SessionDescription,
    TransportError, TransportEvent, TransportEventSink, TransportFactory, to_setup_error,
};
use crate::config::{IceServer, TransportConfig};

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Event sink that goes quiet once the owning transport is closed.
#[derive(Clone)]
struct GuardedSink {
    tx: TransportEventSink,
    closed: Arc<AtomicBool>,
}

impl GuardedSink {
    fn emit(&self, event: TransportEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(event);
    }
}

#[derive(Default)]
pub struct RtcTransportFactory;

impl RtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let api = build_api(SettingEngine::default())?;
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        tracing::trace!(
            target = "tidelink::transport",
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc_result = api.new_peer_connection(rtc_config).await;
        tracing::trace!(
            target = "tidelink::transport",
            await = "api.new_peer_connection",
            state = "end",
            ok = pc_result.is_ok()
        );
        let pc = Arc::new(pc_result.map_err(to_setup_error)?);

        let sink = GuardedSink {
            tx: events,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let channel: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>> =
            Arc::new(AsyncRwLock::new(None));

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index,
                            sdp_mid: init.sdp_mid,
                        }),
                        Err(err) => {
                            tracing::warn!(
                                target = "tidelink::transport",
                                error = %err,
                                "failed to serialize local candidate"
                            );
                            return;
                        }
                    },
                    None => None,
                };
                sink.emit(TransportEvent::CandidateGenerated(candidate));
            })
        }));

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "tidelink::transport", ?state, "peer connection state");
                let mapped = match state {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    // Disconnected may recover; only terminal states matter upstream.
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Unspecified => return,
                };
                sink.emit(TransportEvent::ConnectionStateChanged(mapped));
            })
        }));

        let incoming_sink = sink.clone();
        let incoming_slot = Arc::clone(&channel);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = incoming_sink.clone();
            let slot = Arc::clone(&incoming_slot);
            Box::pin(async move {
                tracing::debug!(
                    target = "tidelink::transport",
                    label = dc.label(),
                    "remote data channel announced"
                );
                attach_channel(&dc, &sink);
                *slot.write().await = Some(dc);
            })
        }));

        Ok(Arc::new(RtcTransport { pc, channel, sink }))
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, sink: &GuardedSink) {
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            tracing::debug!(target = "tidelink::transport", "data channel opened");
            sink.emit(TransportEvent::ChannelOpened);
        })
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            tracing::debug!(target = "tidelink::transport", "data channel closed");
            sink.emit(TransportEvent::ChannelClosed);
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::MessageReceived(msg.data));
        })
    }));
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>>,
    sink: GuardedSink,
}

impl RtcTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.sink.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|err| TransportError::InvalidDescription(err.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::InvalidDescription(format!(
                "unsupported sdp type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_setup_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(to_setup_error)
    }

    async fn add_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), TransportError> {
        self.ensure_open()?;
        // An empty candidate string is how the stack spells end-of-candidates.
        let init = match candidate {
            Some(candidate) => RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            },
            None => RTCIceCandidateInit::default(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_setup_error)
    }

    async fn create_channel(
        &self,
        label: &str,
        opts: ChannelOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let init = RTCDataChannelInit {
            ordered: Some(opts.ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        attach_channel(&dc, &self.sink);
        *self.channel.write().await = Some(dc);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let guard = self.channel.read().await;
        let dc = guard.as_ref().ok_or(TransportError::ChannelNotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelNotOpen);
        }
        dc.send(&payload).await.map_err(to_setup_error)?;
        Ok(())
    }

    async fn close(&self) {
        if self.sink.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(dc) = self.channel.write().await.take() {
            let _ = dc.close().await;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "tidelink::transport",
                error = %err,
                "peer connection close reported an error"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_credentials_are_carried_over() {
        let server = IceServer::turn("turn:relay.example:443", "user", "secret");
        let rtc = to_rtc_ice_server(&server);
        assert_eq!(rtc.urls, vec!["turn:relay.example:443".to_string()]);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");

        let stun = to_rtc_ice_server(&IceServer::stun("stun:stun.example:3478"));
        assert!(stun.username.is_empty());
    }

    #[test]
    fn descriptions_convert_both_ways() {
        let sdp = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string();
        let rtc = to_rtc_description(SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.clone(),
        })
        .unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Offer);
        let back = from_rtc_description(rtc).unwrap();
        assert_eq!(back.kind, SdpKind::Offer);
        assert_eq!(back.sdp, sdp);
    }

    #[tokio::test]
    async fn closed_transport_rejects_calls() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let config = TransportConfig {
            ice_servers: Vec::new(),
            ..TransportConfig::default()
        };
        let transport = RtcTransportFactory::new().create(&config, tx).await.unwrap();
        transport
            .create_channel("chat", ChannelOptions { ordered: true })
            .await
            .unwrap();
        assert!(matches!(
            transport.send(Bytes::from_static(b"early")).await,
            Err(TransportError::ChannelNotOpen)
        ));
        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        transport.close().await;
        transport.close().await;
        assert!(matches!(
            transport.create_offer().await,
            Err(TransportError::Closed)
        ));
    }
}
