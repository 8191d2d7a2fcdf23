//! Local media capture
//!
//! This module models what the call layer needs from capture hardware:
//! tracks that can be enabled, disabled and stopped, streams that group them,
//! and a [`MediaDevices`] seam that opens devices for a set of constraints.
//!
//! # Architecture
//!
//! - [`MediaDevices`] - acquisition and enumeration, implemented per platform
//! - [`VirtualMediaDevices`] - an in-memory device registry that hands out
//!   tracks without touching hardware; used by the CLI and the test suite
//!
//! The call layer never looks at media payloads. A [`LocalTrack`] is a handle
//! with identity and lifecycle; the transport decides how samples flow.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No device matches the constraints
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but another application holds it
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Anything else
    #[error("Media error: {0}")]
    Other(String),
}

/// Coarse category of a [`MediaError`], for user-facing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaErrorCategory {
    /// Access refused
    PermissionDenied,
    /// No matching device
    DeviceNotFound,
    /// Device held elsewhere
    DeviceBusy,
    /// Anything else
    Other,
}

impl MediaError {
    /// Category of this error
    #[must_use]
    pub fn category(&self) -> MediaErrorCategory {
        match self {
            Self::PermissionDenied(_) => MediaErrorCategory::PermissionDenied,
            Self::DeviceNotFound(_) => MediaErrorCategory::DeviceNotFound,
            Self::DeviceBusy(_) => MediaErrorCategory::DeviceBusy,
            Self::Other(_) => MediaErrorCategory::Other,
        }
    }

    /// Message suitable for showing to the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.category() {
            MediaErrorCategory::PermissionDenied => {
                "Could not access camera/microphone. Please grant permissions.".to_string()
            }
            MediaErrorCategory::DeviceNotFound => {
                "No camera or microphone was found. Connect a device and try again.".to_string()
            }
            MediaErrorCategory::DeviceBusy => {
                "Your camera or microphone is in use by another application.".to_string()
            }
            MediaErrorCategory::Other => format!("Could not start media capture: {self}"),
        }
    }
}

// ============================================================================
// Tracks and streams
// ============================================================================

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Lifecycle of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// Producing media
    Live,
    /// Stopped; cannot be restarted
    Ended,
}

/// A single captured audio or video track
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    label: String,
    device_id: String,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl LocalTrack {
    /// Create a live, enabled track for a device
    #[must_use]
    pub fn new(kind: MediaKind, device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            device_id: device_id.into(),
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Device label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Source device identifier
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the track currently carries media (false when muted)
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track without stopping it
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    /// Stop the track and release its device. Idempotent.
    pub fn stop(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!(track_id = %self.id, kind = ?self.kind, "Track stopped");
        }
    }
}

/// An ordered group of local tracks
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaStream {
    /// Create a stream from tracks
    #[must_use]
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks, audio first as acquired
    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    /// First video track, if any
    #[must_use]
    pub fn video_track(&self) -> Option<&Arc<LocalTrack>> {
        self.video_tracks().next()
    }

    /// Stop every track in the stream
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// New stream with the same audio and `video` in place of the old video
    #[must_use]
    pub fn with_video(&self, video: Arc<LocalTrack>) -> Self {
        let mut tracks: Vec<Arc<LocalTrack>> = self.audio_tracks().cloned().collect();
        tracks.push(video);
        Self {
            id: self.id.clone(),
            tracks,
        }
    }
}

// ============================================================================
// Constraints and devices
// ============================================================================

/// Which way a camera faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    User,
    /// Rear camera
    Environment,
}

/// Audio capture constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
    /// Specific device to open
    pub device_id: Option<String>,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_id: None,
        }
    }
}

/// Video capture constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Preferred width in pixels
    pub ideal_width: u32,
    /// Preferred height in pixels
    pub ideal_height: u32,
    /// Preferred camera orientation
    pub facing_mode: FacingMode,
    /// Specific device to open; overrides `facing_mode`
    pub device_id: Option<String>,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            facing_mode: FacingMode::User,
            device_id: None,
        }
    }
}

/// Constraints for one acquisition request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Audio request; `None` means no audio
    pub audio: Option<AudioConstraints>,
    /// Video request; `None` means no video
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio only
    #[must_use]
    pub fn audio_only(audio: AudioConstraints) -> Self {
        Self {
            audio: Some(audio),
            video: None,
        }
    }

    /// Audio and video
    #[must_use]
    pub fn audio_video(audio: AudioConstraints, video: VideoConstraints) -> Self {
        Self {
            audio: Some(audio),
            video: Some(video),
        }
    }

    /// A single camera, used when switching devices mid-call
    #[must_use]
    pub fn camera(video: VideoConstraints) -> Self {
        Self {
            audio: None,
            video: Some(video),
        }
    }
}

/// Kind of capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Microphone
    AudioInput,
    /// Camera
    VideoInput,
}

/// Capture device description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    /// Stable device identifier
    pub device_id: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Human-readable label
    pub label: String,
    /// Camera orientation, if known
    pub facing: Option<FacingMode>,
}

impl MediaDeviceInfo {
    /// Microphone description
    #[must_use]
    pub fn microphone(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind: DeviceKind::AudioInput,
            label: label.into(),
            facing: None,
        }
    }

    /// Camera description
    #[must_use]
    pub fn camera(
        device_id: impl Into<String>,
        label: impl Into<String>,
        facing: Option<FacingMode>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind: DeviceKind::VideoInput,
            label: label.into(),
            facing,
        }
    }
}

/// Pick the camera after `current` in enumeration order, wrapping around
///
/// Returns `None` when there is no other camera to switch to.
#[must_use]
pub fn next_camera<'a>(
    devices: &'a [MediaDeviceInfo],
    current: Option<&str>,
) -> Option<&'a MediaDeviceInfo> {
    let cameras: Vec<&MediaDeviceInfo> = devices
        .iter()
        .filter(|d| d.kind == DeviceKind::VideoInput)
        .collect();
    let position = current.and_then(|id| cameras.iter().position(|d| d.device_id == id));
    match position {
        Some(idx) if cameras.len() > 1 => Some(cameras[(idx + 1) % cameras.len()]),
        Some(_) => None,
        None => cameras.first().copied(),
    }
}

/// Media acquisition seam
///
/// Implement this for the capture stack of your platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open devices matching `constraints` and return live tracks
    ///
    /// # Errors
    ///
    /// Returns a categorised [`MediaError`] if any requested device cannot be opened
    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<MediaStream, MediaError>;

    /// List available capture devices
    ///
    /// # Errors
    ///
    /// Returns error if devices cannot be listed
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError>;
}

// ============================================================================
// Virtual device registry
// ============================================================================

#[derive(Debug)]
struct Registry {
    devices: Vec<MediaDeviceInfo>,
    permission_granted: bool,
    busy: HashSet<String>,
}

/// In-memory [`MediaDevices`] implementation
///
/// Hands out tracks for registered devices and can simulate a refused
/// permission prompt or a device held by another application. Every track it
/// issues is remembered so callers can check that nothing was leaked.
#[derive(Debug)]
pub struct VirtualMediaDevices {
    registry: RwLock<Registry>,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
}

impl VirtualMediaDevices {
    /// Registry with the given devices and permission granted
    #[must_use]
    pub fn new(devices: Vec<MediaDeviceInfo>) -> Self {
        Self {
            registry: RwLock::new(Registry {
                devices,
                permission_granted: true,
                busy: HashSet::new(),
            }),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// A microphone plus front and rear cameras
    #[must_use]
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            MediaDeviceInfo::microphone("mic-0", "Built-in Microphone"),
            MediaDeviceInfo::camera("cam-front", "Front Camera", Some(FacingMode::User)),
            MediaDeviceInfo::camera("cam-rear", "Rear Camera", Some(FacingMode::Environment)),
        ])
    }

    /// Simulate the user answering the permission prompt
    pub fn set_permission(&self, granted: bool) {
        self.registry.write().permission_granted = granted;
    }

    /// Mark a device as held by another application
    pub fn set_busy(&self, device_id: &str, busy: bool) {
        let mut registry = self.registry.write();
        if busy {
            registry.busy.insert(device_id.to_string());
        } else {
            registry.busy.remove(device_id);
        }
    }

    /// Every track handed out so far
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.issued.lock().clone()
    }

    /// Tracks handed out that have not been stopped
    #[must_use]
    pub fn live_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.issued
            .lock()
            .iter()
            .filter(|t| t.ready_state() == TrackState::Live)
            .cloned()
            .collect()
    }

    fn pick_audio<'a>(
        registry: &'a Registry,
        constraints: &AudioConstraints,
    ) -> Result<&'a MediaDeviceInfo, MediaError> {
        let mut mics = registry
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::AudioInput);
        let device = match &constraints.device_id {
            Some(id) => mics.find(|d| &d.device_id == id),
            None => mics.next(),
        };
        device.ok_or_else(|| MediaError::DeviceNotFound("no matching microphone".to_string()))
    }

    fn pick_video<'a>(
        registry: &'a Registry,
        constraints: &VideoConstraints,
    ) -> Result<&'a MediaDeviceInfo, MediaError> {
        let cameras: Vec<&MediaDeviceInfo> = registry
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .collect();
        let device = match &constraints.device_id {
            Some(id) => cameras.iter().find(|d| &d.device_id == id).copied(),
            None => cameras
                .iter()
                .find(|d| d.facing == Some(constraints.facing_mode))
                .or_else(|| cameras.first())
                .copied(),
        };
        device.ok_or_else(|| MediaError::DeviceNotFound("no matching camera".to_string()))
    }

    fn open(registry: &Registry, device: &MediaDeviceInfo) -> Result<Arc<LocalTrack>, MediaError> {
        if registry.busy.contains(&device.device_id) {
            return Err(MediaError::DeviceBusy(device.label.clone()));
        }
        let kind = match device.kind {
            DeviceKind::AudioInput => MediaKind::Audio,
            DeviceKind::VideoInput => MediaKind::Video,
        };
        Ok(Arc::new(LocalTrack::new(
            kind,
            device.device_id.clone(),
            device.label.clone(),
        )))
    }
}

impl Default for VirtualMediaDevices {
    fn default() -> Self {
        Self::with_default_devices()
    }
}

#[async_trait]
impl MediaDevices for VirtualMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        let registry = self.registry.read();
        if !registry.permission_granted {
            return Err(MediaError::PermissionDenied(
                "capture permission was not granted".to_string(),
            ));
        }
        if constraints.audio.is_none() && constraints.video.is_none() {
            return Err(MediaError::Other(
                "at least one of audio or video must be requested".to_string(),
            ));
        }

        // Resolve every device before opening any, so a failure leaks nothing
        let audio = constraints
            .audio
            .as_ref()
            .map(|c| Self::pick_audio(&registry, c))
            .transpose()?;
        let video = constraints
            .video
            .as_ref()
            .map(|c| Self::pick_video(&registry, c))
            .transpose()?;
        for device in audio.iter().chain(video.iter()) {
            if registry.busy.contains(&device.device_id) {
                return Err(MediaError::DeviceBusy(device.label.clone()));
            }
        }

        let mut tracks = Vec::new();
        for device in audio.into_iter().chain(video) {
            tracks.push(Self::open(&registry, device)?);
        }
        drop(registry);

        self.issued.lock().extend(tracks.iter().cloned());
        tracing::debug!(tracks = tracks.len(), "Virtual capture opened");
        Ok(MediaStream::new(tracks))
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(self.registry.read().devices.clone())
    }
}
