//! Per-frame scheduling, modelled on a display's animation-frame callback.

/// Handle for a pending frame request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameRequestId(pub u64);

/// Timing information passed to a frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    /// Monotonic sequence number of the frame.
    pub index: u64,
    /// Nanoseconds since the scheduler was created.
    pub timestamp_ns: u64,
}

pub type FrameCallback = Box<dyn FnOnce(FrameTick) + Send + 'static>;

/// Schedules one callback for the next frame.
///
/// Callbacks are one-shot: a draw loop must request the following frame
/// from inside its callback.
pub trait FrameScheduler: Send + Sync {
    fn request_frame(&self, callback: FrameCallback) -> FrameRequestId;

    /// Cancel a pending request. Cancelling a request that already fired,
    /// or was already cancelled, is a no-op.
    fn cancel_frame(&self, id: FrameRequestId);
}
