//! Local capture and the remote aggregate stream.

use crate::error::{CallError, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

/// A captured track ready to be attached to a peer connection.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (mime_type, clock_rate, channels) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, 48000, 2),
            TrackKind::Video => (MIME_TYPE_VP8, 90000, 0),
        };
        let id = match kind {
            TrackKind::Audio => format!("audio-{}", random_id()),
            TrackKind::Video => format!("video-{}", random_id()),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id,
            stream_id.to_owned(),
        ));
        Self {
            kind,
            track,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    /// Feeds one encoded frame; dropped silently once the track is stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(CallError::from)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Track announced by the remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// RTP source when the transport is webrtc-rs
    pub source: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: String::new(),
            kind,
            source: None,
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Aggregate of every incoming track. Exists (empty) from the moment media
/// is acquired so it can be rendered before anything arrives.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&self, track: RemoteTrack) {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id == track.id) {
            return;
        }
        debug!("remote track added: {:?}", track);
        tracks.push(track);
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    pub fn clear(&self) {
        self.tracks.write().clear();
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Opens capture devices; `CallError::Permission` when denied.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream>;
}

/// Headless capture: VP8 video and Opus audio tracks fed by the caller.
#[derive(Debug, Default, Clone)]
pub struct SyntheticMediaSource;

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        if !constraints.video && !constraints.audio {
            return Err(CallError::permission("no media kinds requested"));
        }
        let stream_id = format!("local-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
        }
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &stream_id));
        }
        info!("acquired synthetic media: {} track(s)", tracks.len());
        Ok(LocalStream::new(stream_id, tracks))
    }
}
