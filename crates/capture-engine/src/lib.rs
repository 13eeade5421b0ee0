//! Capsule Capture Engine
//!
//! Owns every native resource a recording session touches and guarantees
//! it is released exactly once, in a fixed order, on every exit path:
//! normal stop, abort, a recorder error, a dropped future or a device
//! denial halfway through acquisition.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── SessionManager ────────────────────────┐
//! │  reservations (one session per device)     MonitorService      │
//! │                                                                │
//! │  ┌──────────────────── CaptureSession ──────────────────────┐  │
//! │  │  CaptureDeviceAcquirer ─▶ streams ─▶ FrameCompositor     │  │
//! │  │                              │            │              │  │
//! │  │                              ▼            ▼              │  │
//! │  │                       RecordingSink ◀─ CompositeStream   │  │
//! │  │  RecordingTimer                                          │  │
//! │  │                                                          │  │
//! │  │  ResourceRegistry ──▶ CleanupCoordinator (ordered)       │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod acquirer;
pub mod backend;
pub mod cleanup;
pub mod compositor;
pub mod monitor;
pub mod recorder;
pub mod registry;
pub mod session;
pub mod timer;

#[cfg(test)]
mod test_support;

pub use acquirer::{classify_failure, CaptureDeviceAcquirer};
pub use backend::{create_platform, BackendKind};
pub use cleanup::{CleanupCoordinator, CleanupReport};
pub use compositor::{picture_in_picture, CompositeStream, FrameCompositor, PixelBuffer, Placement};
pub use monitor::{HeapProbe, MemorySample, MonitorService, SystemHeapProbe};
pub use recorder::{RawClip, RecordingSink, SinkState};
pub use registry::{ResourceHandle, ResourceRegistry};
pub use session::{SessionHandle, SessionInfo, SessionManager, SessionRequest, StoppedSession};
pub use timer::RecordingTimer;
