//! Capture streams and the frames they expose.

use std::any::Any;
use std::sync::Arc;

use capsule_common::kind::DeviceKind;

use crate::PlatformResult;

/// One RGBA8 video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA pixels, `width * height * 4` bytes.
    pub pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: impl Into<Arc<[u8]>>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// A frame filled with one colour.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self::new(width, height, pixels)
    }

    /// Pixel at `(x, y)`, if inside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.pixels.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// Something the compositor can read the latest frame from.
pub trait FrameSource: Send + Sync {
    /// The most recent frame, or `None` when nothing is available yet
    /// (or the source has ended).
    fn current_frame(&self) -> Option<Frame>;
}

/// Lifecycle of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// Snapshot of one track inside a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub label: String,
    pub is_video: bool,
    pub state: TrackState,
}

/// A live capture stream held by a session.
pub trait MediaStream: Send + Sync {
    /// Stable identifier for logs and recorder wiring.
    fn id(&self) -> &str;

    /// The device this stream captures; `None` for derived streams such
    /// as the compositor output.
    fn device(&self) -> Option<DeviceKind>;

    /// Current track snapshot.
    fn tracks(&self) -> Vec<TrackInfo>;

    /// Stop every track. Stopping an already-stopped stream is a no-op.
    fn stop(&self) -> PlatformResult<()>;

    /// Frame access for compositing, when the backend provides it.
    fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        None
    }

    /// Downcast hook for backends that wire their own stream types
    /// into their recorders.
    fn as_any(&self) -> &dyn Any;

    /// Whether every track has ended.
    fn is_ended(&self) -> bool {
        self.tracks()
            .iter()
            .all(|track| track.state == TrackState::Ended)
    }

    fn has_video(&self) -> bool {
        self.tracks().iter().any(|track| track.is_video)
    }

    fn has_audio(&self) -> bool {
        self.tracks().iter().any(|track| !track.is_video)
    }
}
