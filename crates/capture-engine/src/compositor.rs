//! Per-frame compositing of several video sources into one pixel buffer.
//!
//! The draw loop is cooperative: every callback re-checks the `active`
//! flag before drawing and requests the next frame only while still active.
//! [`FrameCompositor::stop`] clears the flag and cancels the pending
//! request, so no draw runs once it returns.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use capsule_common::kind::DeviceKind;
use capsule_platform_core::{
    Frame, FrameRequestId, FrameScheduler, FrameSource, FrameTick, MediaStream, PlatformResult,
    TrackInfo, TrackState,
};
use parking_lot::Mutex;

const BACKGROUND: [u8; 4] = [0, 0, 0, 255];

/// Destination rectangle of one source on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Layout for `count` sources: the first fills the canvas, the rest are
/// stacked upwards from the bottom-right corner at a quarter of the width.
pub fn picture_in_picture(canvas_width: u32, canvas_height: u32, count: usize) -> Vec<Placement> {
    let mut placements = Vec::with_capacity(count);
    if count == 0 {
        return placements;
    }
    placements.push(Placement {
        x: 0,
        y: 0,
        width: canvas_width,
        height: canvas_height,
    });

    let width = (canvas_width / 4).max(1);
    let height = ((u64::from(width) * u64::from(canvas_height)) / u64::from(canvas_width.max(1)))
        .max(1) as u32;
    let margin = (canvas_width / 64).max(1);
    for slot in 1..count as u32 {
        placements.push(Placement {
            x: canvas_width.saturating_sub(margin + width),
            y: canvas_height.saturating_sub((margin + height) * slot),
            width,
            height,
        });
    }
    placements
}

/// Shared RGBA canvas the compositor draws into and the recorder reads.
pub struct PixelBuffer {
    width: u32,
    height: u32,
    pixels: Mutex<Vec<u8>>,
    released: AtomicBool,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: Mutex::new(vec![0; width as usize * height as usize * 4]),
            released: AtomicBool::new(false),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Fill the whole canvas with one colour.
    pub fn clear(&self, rgba: [u8; 4]) {
        let mut pixels = self.pixels.lock();
        for px in pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    /// Draw `frame` into `placement` with nearest-neighbour scaling,
    /// clipped to the canvas.
    pub fn blit_scaled(&self, frame: &Frame, placement: Placement) {
        if frame.width == 0 || frame.height == 0 || placement.width == 0 || placement.height == 0
        {
            return;
        }
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.pixels.len() < expected {
            tracing::trace!(
                width = frame.width,
                height = frame.height,
                len = frame.pixels.len(),
                "Skipping short frame"
            );
            return;
        }

        let mut pixels = self.pixels.lock();
        if pixels.is_empty() {
            return;
        }
        let canvas_w = self.width as usize;
        for dy in 0..placement.height {
            let ty = placement.y + dy;
            if ty >= self.height {
                break;
            }
            let sy = (u64::from(dy) * u64::from(frame.height) / u64::from(placement.height)) as usize;
            for dx in 0..placement.width {
                let tx = placement.x + dx;
                if tx >= self.width {
                    break;
                }
                let sx =
                    (u64::from(dx) * u64::from(frame.width) / u64::from(placement.width)) as usize;
                let src = (sy * frame.width as usize + sx) * 4;
                let dst = (ty as usize * canvas_w + tx as usize) * 4;
                pixels[dst..dst + 4].copy_from_slice(&frame.pixels[src..src + 4]);
            }
        }
    }

    /// Copy of the current canvas, or `None` once released.
    pub fn snapshot(&self) -> Option<Frame> {
        if self.is_released() {
            return None;
        }
        let pixels = self.pixels.lock();
        Some(Frame::new(self.width, self.height, pixels.as_slice()))
    }

    /// Drop the pixel storage. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            *self.pixels.lock() = Vec::new();
        }
    }
}

impl FrameSource for PixelBuffer {
    fn current_frame(&self) -> Option<Frame> {
        self.snapshot()
    }
}

struct LoopInner {
    active: AtomicBool,
    /// Held for the whole draw step so `stop` waits out an in-flight frame.
    pending: Mutex<Option<FrameRequestId>>,
    frames_drawn: AtomicU64,
    sources: Vec<Arc<dyn FrameSource>>,
    layout: Vec<Placement>,
    buffer: Arc<PixelBuffer>,
    scheduler: Arc<dyn FrameScheduler>,
}

impl LoopInner {
    fn request_next(inner: &Arc<LoopInner>, pending: &mut Option<FrameRequestId>) {
        if !inner.active.load(Ordering::SeqCst) {
            return;
        }
        let weak: Weak<LoopInner> = Arc::downgrade(inner);
        let id = inner.scheduler.request_frame(Box::new(move |tick| {
            if let Some(inner) = weak.upgrade() {
                LoopInner::on_frame(&inner, tick);
            }
        }));
        *pending = Some(id);
    }

    fn on_frame(inner: &Arc<LoopInner>, tick: FrameTick) {
        let mut pending = inner.pending.lock();
        if !inner.active.load(Ordering::SeqCst) {
            return;
        }
        *pending = None;

        if inner.buffer.is_released() {
            tracing::debug!("Frame buffer released; compositor idling");
            return;
        }
        inner.buffer.clear(BACKGROUND);
        for (source, placement) in inner.sources.iter().zip(&inner.layout) {
            if let Some(frame) = source.current_frame() {
                inner.buffer.blit_scaled(&frame, *placement);
            }
        }
        inner.frames_drawn.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(index = tick.index, "Composited frame");

        LoopInner::request_next(inner, &mut pending);
    }
}

/// A running draw loop.
pub struct FrameCompositor {
    inner: Arc<LoopInner>,
}

impl FrameCompositor {
    /// Start drawing `sources` into `buffer` once per scheduler frame.
    pub fn start(
        sources: Vec<Arc<dyn FrameSource>>,
        buffer: Arc<PixelBuffer>,
        scheduler: Arc<dyn FrameScheduler>,
    ) -> Self {
        let layout = picture_in_picture(buffer.width(), buffer.height(), sources.len());
        let inner = Arc::new(LoopInner {
            active: AtomicBool::new(true),
            pending: Mutex::new(None),
            frames_drawn: AtomicU64::new(0),
            sources,
            layout,
            buffer,
            scheduler,
        });
        {
            let mut pending = inner.pending.lock();
            LoopInner::request_next(&inner, &mut pending);
        }
        tracing::debug!(sources = inner.sources.len(), "Compositor started");
        Self { inner }
    }

    /// Stop the loop and cancel the pending frame request. Idempotent.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let id = self.inner.pending.lock().take();
        if let Some(id) = id {
            self.inner.scheduler.cancel_frame(id);
        }
        tracing::debug!(
            frames = self.frames_drawn(),
            "Compositor stopped"
        );
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn frames_drawn(&self) -> u64 {
        self.inner.frames_drawn.load(Ordering::Relaxed)
    }

    pub fn has_pending_frame(&self) -> bool {
        self.inner.pending.lock().is_some()
    }
}

impl Drop for FrameCompositor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The composited canvas exposed as a capture stream.
pub struct CompositeStream {
    id: String,
    buffer: Arc<PixelBuffer>,
    stopped: AtomicBool,
}

impl CompositeStream {
    pub fn new(buffer: Arc<PixelBuffer>) -> Self {
        Self {
            id: format!("composite-{}", uuid::Uuid::new_v4()),
            buffer,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn buffer(&self) -> &Arc<PixelBuffer> {
        &self.buffer
    }
}

impl FrameSource for CompositeStream {
    fn current_frame(&self) -> Option<Frame> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.buffer.snapshot()
    }
}

impl MediaStream for CompositeStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn device(&self) -> Option<DeviceKind> {
        None
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        let ended = self.stopped.load(Ordering::SeqCst) || self.buffer.is_released();
        vec![TrackInfo {
            label: "composite".to_string(),
            is_video: true,
            state: if ended {
                TrackState::Ended
            } else {
                TrackState::Live
            },
        }]
    }

    fn stop(&self) -> PlatformResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        Some(self.buffer.clone() as Arc<dyn FrameSource>)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
