//! Media Session contract.
//!
//! The controller drives a peer connection through [`MediaSession`] and never
//! looks inside SDP. Notifications from the connection are delivered as
//! [`MediaEvent`]s through a [`MediaEventSink`] bound to the session
//! generation that opened it, so late callbacks from a torn-down connection
//! can be recognised and dropped.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use peerline_common::{Error, IceCandidate, Result};

use crate::controller::Event;
use crate::types::MediaConstraints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured local track. Stopping releases the device; it cannot restart.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
    rtp: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
            rtp: None,
        }
    }

    pub(crate) fn with_rtp(
        id: impl Into<String>,
        kind: TrackKind,
        rtp: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            rtp: Some(rtp),
            ..Self::new(id, kind)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Returns `true` only for the call that actually stopped the track.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn rtp(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.rtp.clone()
    }

    /// Feed one encoded frame from the capture source.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::media(format!("track {} is stopped", self.id)));
        }
        let Some(rtp) = self.rtp.as_ref() else {
            return Err(Error::media(format!("track {} has no RTP sink", self.id)));
        };
        rtp.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
        .map_err(Error::media)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The camera/microphone stream of one call.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Stops every track. Safe to call repeatedly; returns how many tracks
    /// this call stopped.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|track| track.stop()).count()
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.iter().all(|track| track.is_stopped())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Local ICE candidate to relay to the peer.
    IceCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteTrack),
}

/// Delivers notifications from one media session into the controller queue.
#[derive(Clone)]
pub struct MediaEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl MediaEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the controller has stopped.
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.tx
            .send(Event::Media {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Peer-to-peer media transport, owned by exactly one call session.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn add_local_track(&self, track: Arc<LocalTrack>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates media sessions and captures local media.
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn acquire_local_media(&self, constraints: MediaConstraints) -> Result<LocalMedia>;
    async fn open(&self, sink: MediaEventSink) -> Result<Arc<dyn MediaSession>>;
}
