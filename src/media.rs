//! Local camera/microphone capture.
//!
//! [`MediaCaptureManager`] is the only owner of device handles. Everyone else (the
//! transport attaching tracks, the UI rendering a preview) holds a [`MediaHandle`], which
//! is read-only.

use crate::error::CaptureError;
use crate::peer::types::MediaKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// What to ask the device backend for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

/// Platform device access. `get_user_media` is where a permission prompt happens and it may
/// never resolve; callers bound it with a timeout.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, CaptureError>;
}

/// One captured track. Samples written while disabled are dropped, so a muted track keeps
/// its device open and its RTP sender attached.
#[derive(Debug)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Track backed by a sample sink: VP8 for video, Opus for audio.
    pub fn sample_track(kind: MediaKind, stream_id: &str) -> Self {
        let (mime_type, clock_rate, channels, id) = match kind {
            MediaKind::Video => (MIME_TYPE_VP8, 90_000, 0, "video"),
            MediaKind::Audio => (MIME_TYPE_OPUS, 48_000, 2, "audio"),
        };
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        Self::new(kind, Arc::new(track))
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The RTP-level track handed to peer transports.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Feeds one encoded frame from the capture pipeline.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), CaptureError> {
        if self.is_stopped() {
            return Err(CaptureError::Released);
        }
        if !self.is_enabled() {
            return Ok(());
        }
        // No attached sender is not an error: between sessions frames go nowhere.
        if let Err(e) = self.track.write_sample(sample).await {
            debug!("dropping {:?} sample: {e}", self.kind);
        }
        Ok(())
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct HandleInner {
    tracks: Vec<Arc<LocalTrack>>,
    valid: AtomicBool,
}

/// Shared, read-only view of the acquired capture session.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    inner: Arc<HandleInner>,
}

impl MediaHandle {
    fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                tracks,
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.inner.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.inner.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn video_enabled(&self) -> bool {
        self.tracks_of(MediaKind::Video).any(|t| t.is_enabled())
    }

    pub fn audio_enabled(&self) -> bool {
        self.tracks_of(MediaKind::Audio).any(|t| t.is_enabled())
    }

    /// False once the manager released the devices.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    pub fn same_capture(&self, other: &MediaHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Device backend for the native client: tracks are sample sinks fed by an external
/// capture/encode pipeline through [`LocalTrack::write_sample`].
pub struct SampleTrackDevices {
    stream_id: String,
}

impl SampleTrackDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<LocalTrack>>, CaptureError> {
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::sample_track(MediaKind::Video, &self.stream_id)));
        }
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::sample_track(MediaKind::Audio, &self.stream_id)));
        }
        Ok(tracks)
    }
}

/// Owns the local capture session for the lifetime of the application.
pub struct MediaCaptureManager {
    devices: Arc<dyn MediaDevices>,
    // Held across the device request so concurrent callers share one prompt.
    acquire_lock: tokio::sync::Mutex<()>,
    handle: Mutex<Option<MediaHandle>>,
    video_enabled: AtomicBool,
    audio_enabled: AtomicBool,
}

impl MediaCaptureManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            acquire_lock: tokio::sync::Mutex::new(()),
            handle: Mutex::new(None),
            video_enabled: AtomicBool::new(true),
            audio_enabled: AtomicBool::new(true),
        }
    }

    /// Requests camera and microphone. Returns the existing handle when already acquired.
    pub async fn acquire(&self) -> Result<MediaHandle, CaptureError> {
        let _guard = self.acquire_lock.lock().await;
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        info!("requesting camera and microphone");
        let tracks = self
            .devices
            .get_user_media(MediaConstraints::default())
            .await
            .inspect_err(|e| warn!("media capture failed: {e}"))?;
        if tracks.is_empty() {
            return Err(CaptureError::DeviceUnavailable("no tracks returned".into()));
        }

        let video = self.video_enabled.load(Ordering::SeqCst);
        let audio = self.audio_enabled.load(Ordering::SeqCst);
        for track in &tracks {
            track.set_enabled(match track.kind() {
                MediaKind::Video => video,
                MediaKind::Audio => audio,
            });
        }

        let handle = MediaHandle::new(tracks);
        info!("media acquired: {} track(s)", handle.tracks().len());
        *self.handle.lock() = Some(handle.clone());
        Ok(handle)
    }

    pub fn handle(&self) -> Option<MediaHandle> {
        self.handle.lock().clone()
    }

    pub fn is_acquired(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Mutes or unmutes video without touching the device. Returns the resulting state.
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(MediaKind::Video, enabled)
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(MediaKind::Audio, enabled)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let flag = match kind {
            MediaKind::Video => &self.video_enabled,
            MediaKind::Audio => &self.audio_enabled,
        };
        flag.store(enabled, Ordering::SeqCst);
        if let Some(handle) = self.handle() {
            for track in handle.tracks_of(kind) {
                track.set_enabled(enabled);
            }
        }
        debug!("{kind:?} enabled={enabled}");
        enabled
    }

    /// Stops every track and invalidates the handle. Application teardown only.
    pub fn release(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        for track in handle.tracks() {
            track.stop();
        }
        handle.inner.valid.store(false, Ordering::SeqCst);
        info!("media released");
    }
}
