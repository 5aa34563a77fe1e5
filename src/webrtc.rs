//! [`PeerConnector`] backed by the `webrtc` crate.

use crate::media::{LocalMedia, RemoteTrack, TrackKind};
use crate::negotiator::{PeerConnector, PeerEvent, PeerEventSink, PeerState, PeerTransport};
use async_trait::async_trait;
use callcore::types::{IceCandidate, SdpType, SessionDescription};
use log::{debug, info, warn};
use std::sync::Arc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const RTCP_BUFFER_SIZE: usize = 1500;

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment.clone(),
    }
}

fn to_rtc_description(description: &SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    let sdp = description.sdp.clone();
    let rtc = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpType::Rollback => anyhow::bail!("rollback descriptions are not supported"),
    };
    Ok(rtc)
}

/// Creates one `RTCPeerConnection` per negotiation.
#[derive(Debug, Clone)]
pub struct WebRtcPeerConnector {
    ice_servers: Vec<String>,
}

impl WebRtcPeerConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn create_api() -> anyhow::Result<webrtc::api::API> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcPeerConnector {
    async fn connect(
        &self,
        local_media: &LocalMedia,
        events: PeerEventSink,
    ) -> anyhow::Result<Arc<dyn PeerTransport>> {
        let api = Self::create_api()?;
        let peer_connection = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);

        for local in local_media.tracks() {
            let track: Arc<dyn TrackLocal + Send + Sync> = local.track.clone();
            let sender = peer_connection.add_track(track).await?;
            // RTCP must be drained for interceptors such as NACK to work.
            tokio::spawn(async move {
                let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let candidate_sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(candidate_from_init(init))).await;
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {e}"),
                }
            })
        }));

        let track_sink = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    let remote = RemoteTrack {
                        kind: TrackKind::from(track.kind()),
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        handle: Some(track),
                    };
                    sink.emit(PeerEvent::TrackAdded(remote)).await;
                })
            },
        ));

        let state_sink = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = state_sink.clone();
                Box::pin(async move {
                    info!(
                        "Peer connection {} state: {state}",
                        sink.negotiation_id()
                    );
                    sink.emit(PeerEvent::StateChanged(state.into())).await;
                })
            },
        ));

        Ok(Arc::new(WebRtcPeerTransport { peer_connection }))
    }
}

struct WebRtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> anyhow::Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        self.peer_connection
            .add_ice_candidate(to_candidate_init(candidate))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!("Error closing peer connection: {e}");
        }
    }
}
