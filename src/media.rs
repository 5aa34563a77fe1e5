//! Local capture and remote media handles.
//!
//! [`LocalMedia`] is acquired once per controller through a [`MediaSource`]
//! and reused for every call. [`RemoteMedia`] belongs to one negotiation and
//! is dropped with it.

use async_trait::async_trait;
use callcore::error::CallError;
use log::info;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

static NEXT_MEDIA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        CallError::MediaUnavailable {
            reason: err.to_string(),
        }
    }
}

/// A locally captured track the host writes encoded samples into.
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub track: Arc<TrackLocalStaticSample>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .finish()
    }
}

struct LocalMediaInner {
    id: String,
    tracks: Vec<LocalTrack>,
    stopped: AtomicBool,
}

/// Cheap-clone handle to the local capture.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        let id = format!("local-{}", NEXT_MEDIA_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(LocalMediaInner {
                id,
                tracks,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    /// Whether both handles refer to the same acquisition.
    pub fn same_handle(&self, other: &LocalMedia) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Releases the capture. Only the controller's shutdown calls this.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            info!("Local media {} released", self.inner.id);
        }
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// One inbound track. `handle` is absent for tracks produced by test doubles.
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub track_id: String,
    pub stream_id: String,
    pub handle: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(kind: TrackKind, track_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            kind,
            track_id: track_id.into(),
            stream_id: stream_id.into(),
            handle: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Inbound media of a single negotiation.
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    pub negotiation_id: u64,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    pub fn new(negotiation_id: u64) -> Self {
        Self {
            negotiation_id,
            tracks: Vec::new(),
        }
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Obtains the local camera and microphone capture.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;
}

/// Builds an Opus audio track and a VP8 video track that the host feeds
/// with encoded samples via `TrackLocalStaticSample::write_sample`.
#[derive(Debug, Clone)]
pub struct SampleTrackSource {
    stream_id: String,
}

impl SampleTrackSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

impl Default for SampleTrackSource {
    fn default() -> Self {
        Self::new("matchcall")
    }
}

#[async_trait]
impl MediaSource for SampleTrackSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            self.stream_id.clone(),
        ));
        Ok(LocalMedia::new(vec![
            LocalTrack {
                kind: TrackKind::Audio,
                track: audio,
            },
            LocalTrack {
                kind: TrackKind::Video,
                track: video,
            },
        ]))
    }
}
