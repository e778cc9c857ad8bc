//! Media Session backed by the `webrtc` crate.
//!
//! Capture devices are outside this crate. Local tracks are static-sample
//! tracks: whatever encodes camera or microphone frames pushes them through
//! [`LocalTrack::write_sample`](crate::media::LocalTrack::write_sample).

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use peerline_common::{Error, IceCandidate, Result};

use crate::media::{
    ConnectionState, LocalMedia, LocalTrack, MediaEvent, MediaEventSink, MediaFactory,
    MediaSession, RemoteTrack, SdpKind, SessionDescription, TrackKind,
};
use crate::types::{IceServerConfig, MediaConstraints};

const STREAM_ID: &str = "peerline";

pub struct RtcMediaFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcMediaFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

fn sample_track(kind: TrackKind) -> LocalTrack {
    let (id, capability) = match kind {
        TrackKind::Audio => (
            "audio",
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        ),
        TrackKind::Video => (
            "video",
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        ),
    };
    let rtp = Arc::new(TrackLocalStaticSample::new(
        capability,
        id.to_string(),
        STREAM_ID.to_string(),
    ));
    LocalTrack::with_rtp(id, kind, rtp)
}

#[async_trait]
impl MediaFactory for RtcMediaFactory {
    async fn acquire_local_media(&self, constraints: MediaConstraints) -> Result<LocalMedia> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(sample_track(TrackKind::Audio)));
        }
        if constraints.video {
            tracks.push(Arc::new(sample_track(TrackKind::Video)));
        }
        if tracks.is_empty() {
            return Err(Error::media("neither audio nor video was requested"));
        }
        Ok(LocalMedia::new(tracks))
    }

    async fn open(&self, sink: MediaEventSink) -> Result<Arc<dyn MediaSession>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(Error::media)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(Error::media)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(Error::media)?,
        );
        debug!("Opened peer connection for session {}", sink.generation());

        let candidates = sink.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let sink = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(MediaEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let states = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Peer connection state: {}", state);
            states.emit(MediaEvent::ConnectionState(connection_state(state)));
            Box::pin(async {})
        }));

        let tracks = sink;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            tracks.emit(MediaEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcMediaSession { pc }))
    }
}

pub(crate) fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    rtc.map_err(Error::media)
}

pub struct RtcMediaSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(Error::media)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(Error::media)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(Error::media)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(Error::media)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(Error::media)
    }

    async fn add_local_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let Some(rtp) = track.rtp() else {
            return Err(Error::media(format!(
                "track {} cannot be sent over RTP",
                track.id()
            )));
        };
        let sender = self
            .pc
            .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(Error::media)?;

        // Interceptors only run while incoming RTCP is read.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::media)
    }
}
