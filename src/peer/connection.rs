use crate::error::TransportError;
use crate::logger::dump_selected_pair;
use crate::media::LocalTrack;
use crate::peer::ice::to_rtc_ice_servers;
use crate::peer::transport::{
    PeerTransport, SessionTransportEvent, TransportEvent, TransportEventSender, TransportFactory,
    TransportState,
};
use crate::peer::types::{
    IceCandidate, MediaKind, RemoteTrackInfo, SdpKind, ServerConfig, SessionDescription, SessionId,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds `webrtc` peer connections with the user's current ICE servers.
pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Arc<RwLock<Vec<ServerConfig>>>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Arc<RwLock<Vec<ServerConfig>>>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        session_id: SessionId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = rtc_config(&self.ice_servers.read());
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let transport = WebRtcTransport {
            pc,
            session_id,
            senders: Mutex::new(Vec::new()),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
        };
        transport.install_handlers(events);
        Ok(Arc::new(transport))
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// `PeerTransport` over a `webrtc` peer connection.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    session_id: SessionId,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
}

impl WebRtcTransport {
    /// Remote media for rendering.
    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.remote_tracks.lock().clone()
    }

    fn install_handlers(&self, events: TransportEventSender) {
        let tag = {
            let session_id = self.session_id.clone();
            move |event| SessionTransportEvent {
                session_id: session_id.clone(),
                event,
            }
        };

        let tx = events.clone();
        let tagger = tag.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let event = match cand.map(|c| c.to_json()) {
                    Some(Ok(init)) => Some(TransportEvent::LocalCandidate(init.into())),
                    Some(Err(e)) => {
                        warn!("cannot serialize local candidate: {e}");
                        None
                    }
                    None => Some(TransportEvent::GatheringComplete),
                };
                if let Some(event) = event {
                    let _ = tx.send(tagger(event));
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        let tagger = tag.clone();
        let remote_tracks = self.remote_tracks.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let info = RemoteTrackInfo {
                id: track.id(),
                kind,
            };
            debug!("remote {kind:?} track {}", info.id);
            remote_tracks.lock().push(track);
            let _ = tx.send(tagger(TransportEvent::RemoteTrack(info)));
            Box::pin(async {})
        }));

        let tx = events;
        let pc = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                info!("Peer connection state changed to: {:?}", st);
                let state = match st {
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                    _ => TransportState::New,
                };
                let _ = tx.send(tag(TransportEvent::ConnectionState(state)));

                let pc = pc.clone();
                Box::pin(async move {
                    if matches!(state, TransportState::Disconnected | TransportState::Failed) {
                        if let Some(pc) = pc.upgrade() {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        }
                    }
                })
            }));
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn attach_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let sender = self
            .pc
            .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        debug!("attached local {:?} track {}", track.kind(), track.id());
        self.senders.lock().push(sender);
        Ok(())
    }

    async fn detach_tracks(&self) -> Result<(), TransportError> {
        let senders = std::mem::take(&mut *self.senders.lock());
        for sender in senders {
            // remove_track only clears the sender; the local track keeps capturing.
            if let Err(e) = self.pc.remove_track(&sender).await {
                debug!("remove_track: {e}");
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.remote_tracks.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}
