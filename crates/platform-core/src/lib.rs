//! Capsule platform core contracts.
//!
//! This crate defines the capability interfaces the capture engine drives
//! without coupling to a concrete media framework: capture devices,
//! streams, frame sources, the chunk-accumulating recorder and the
//! per-frame scheduler. Backends (synthetic, GStreamer) implement them.

pub mod blob;
pub mod recorder;
pub mod scheduler;
pub mod stream;

use std::sync::Arc;

use capsule_common::kind::DeviceKind;
use serde::{Deserialize, Serialize};

pub use blob::Blob;
pub use recorder::{
    MediaRecorder, RecorderEvent, RecorderEventKind, RecorderHandler, RecorderHandlers,
    RecorderOptions, RecorderState,
};
pub use scheduler::{FrameCallback, FrameRequestId, FrameScheduler, FrameTick};
pub use stream::{Frame, FrameSource, MediaStream, TrackInfo, TrackState};

/// Constraints passed along with a capture request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Requested width in pixels (video devices only).
    pub width: u32,
    /// Requested height in pixels (video devices only).
    pub height: u32,
    /// Requested frame rate.
    pub fps: u32,
    /// Specific device to open; the platform default when unset.
    pub device_id: Option<String>,
    /// Audio sample rate (microphone only).
    pub sample_rate: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            device_id: None,
            sample_rate: 48000,
        }
    }
}

/// Raw failure reported by the platform.
///
/// `name` follows the conventional capture error names
/// (`NotAllowedError`, `NotFoundError`, ...); the acquirer classifies it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct PlatformError {
    pub name: String,
    pub message: String,
}

impl PlatformError {
    pub const NOT_ALLOWED: &'static str = "NotAllowedError";
    pub const NOT_FOUND: &'static str = "NotFoundError";
    pub const NOT_SUPPORTED: &'static str = "NotSupportedError";
    pub const NOT_READABLE: &'static str = "NotReadableError";
    pub const NETWORK: &'static str = "NetworkError";
    pub const ABORT: &'static str = "AbortError";
    pub const INVALID_STATE: &'static str = "InvalidStateError";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_ALLOWED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(Self::NOT_SUPPORTED, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_STATE, message)
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// A media platform: capture devices, recorders and a frame scheduler.
#[async_trait::async_trait]
pub trait MediaPlatform: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Request capture of one device. Suspends while the platform asks
    /// the user for permission.
    async fn request_capture(
        &self,
        kind: DeviceKind,
        constraints: &CaptureConstraints,
    ) -> PlatformResult<Arc<dyn MediaStream>>;

    /// Build a recorder that consumes the given streams.
    fn create_recorder(
        &self,
        inputs: &[Arc<dyn MediaStream>],
        options: &RecorderOptions,
    ) -> PlatformResult<Arc<dyn MediaRecorder>>;

    /// The per-frame scheduler used by the compositor.
    fn frame_scheduler(&self) -> Arc<dyn FrameScheduler>;
}
