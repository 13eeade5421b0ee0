//! The chunk-accumulating recorder abstraction.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{PlatformError, PlatformResult};

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderOptions {
    /// Preferred container/codec; backends fall back to their native type.
    pub mime_type: Option<String>,
    /// How often buffered data is delivered as a data-available event.
    pub timeslice: Duration,
    /// Frame rate the recorder samples its video input at.
    pub fps: u32,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            mime_type: None,
            timeslice: Duration::from_secs(1),
            fps: 30,
        }
    }
}

/// Platform-level recorder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Inactive,
    Recording,
}

/// Events a recorder delivers to its handlers.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    Start,
    DataAvailable(Vec<u8>),
    Stop,
    Error(PlatformError),
}

impl RecorderEvent {
    pub fn kind(&self) -> RecorderEventKind {
        match self {
            RecorderEvent::Start => RecorderEventKind::Start,
            RecorderEvent::DataAvailable(_) => RecorderEventKind::DataAvailable,
            RecorderEvent::Stop => RecorderEventKind::Stop,
            RecorderEvent::Error(_) => RecorderEventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderEventKind {
    Start,
    DataAvailable,
    Stop,
    Error,
}

impl RecorderEventKind {
    pub const ALL: [RecorderEventKind; 4] = [
        RecorderEventKind::Start,
        RecorderEventKind::DataAvailable,
        RecorderEventKind::Stop,
        RecorderEventKind::Error,
    ];

    fn slot(self) -> usize {
        match self {
            RecorderEventKind::Start => 0,
            RecorderEventKind::DataAvailable => 1,
            RecorderEventKind::Stop => 2,
            RecorderEventKind::Error => 3,
        }
    }
}

pub type RecorderHandler = Arc<dyn Fn(RecorderEvent) + Send + Sync>;

/// Handler slots shared by recorder implementations.
///
/// A handler closure typically captures the owning session's buffers, so
/// every slot must be cleared on teardown or the session graph stays
/// reachable through the recorder.
#[derive(Default)]
pub struct RecorderHandlers {
    slots: Mutex<[Option<RecorderHandler>; 4]>,
}

impl RecorderHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: RecorderEventKind, handler: RecorderHandler) {
        self.slots.lock()[kind.slot()] = Some(handler);
    }

    pub fn clear(&self, kind: RecorderEventKind) {
        self.slots.lock()[kind.slot()] = None;
    }

    pub fn clear_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn is_set(&self, kind: RecorderEventKind) -> bool {
        self.slots.lock()[kind.slot()].is_some()
    }

    /// Number of handlers currently attached.
    pub fn count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    /// Deliver an event. The lock is released before the handler runs so a
    /// handler may clear slots.
    pub fn emit(&self, event: RecorderEvent) {
        let handler = self.slots.lock()[event.kind().slot()].clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

/// A platform recorder fed by one or more streams.
///
/// `stop` only requests the stop: the recorder delivers its final
/// data-available event and then the stop event asynchronously.
pub trait MediaRecorder: Send + Sync {
    /// Media type of the produced data.
    fn mime_type(&self) -> &str;

    fn state(&self) -> RecorderState;

    fn start(&self, timeslice: Duration) -> PlatformResult<()>;

    fn stop(&self) -> PlatformResult<()>;

    fn handlers(&self) -> &RecorderHandlers;

    /// Whether data arrives every `timeslice`. Recorders that return
    /// `false` deliver the whole recording as one chunk on stop.
    fn delivers_chunks(&self) -> bool {
        true
    }
}
