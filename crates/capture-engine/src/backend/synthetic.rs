//! In-process synthetic devices.
//!
//! Cameras and screens generate coloured frames with a moving bar, the
//! microphone a 440 Hz tone. The recorder samples its inputs on the tokio
//! clock and emits a YUV4MPEG2 stream (or WAV when there is no video), so
//! a whole session runs deterministically under a paused test clock and
//! produces a clip ffmpeg can read.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use capsule_common::clock::ChunkPacer;
use capsule_common::kind::DeviceKind;
use capsule_platform_core::{
    CaptureConstraints, Frame, FrameScheduler, FrameSource, MediaPlatform, MediaRecorder,
    MediaStream, PlatformError, PlatformResult, RecorderEvent, RecorderHandlers, RecorderOptions,
    RecorderState, TrackInfo, TrackState,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::scheduler::IntervalFrameScheduler;

pub const Y4M_MIME: &str = "video/x-yuv4mpeg";
pub const WAV_MIME: &str = "audio/wav";

const TONE_HZ: f64 = 440.0;

/// Behaviour knobs for [`SyntheticPlatform`].
#[derive(Debug, Clone, Default)]
pub struct SyntheticConfig {
    /// Requests for these kinds fail with the given error.
    pub denials: HashMap<DeviceKind, PlatformError>,
    /// How long each grant takes, standing in for a permission prompt.
    pub grant_delay: Duration,
    /// Streams of these kinds report an error when stopped.
    pub stop_failures: HashSet<DeviceKind>,
    /// Streams of these kinds are already ended when handed out.
    pub ended_on_grant: HashSet<DeviceKind>,
    /// Compositor tick rate; 30 when zero.
    pub frame_rate: u32,
}

impl SyntheticConfig {
    pub fn deny(mut self, kind: DeviceKind, error: PlatformError) -> Self {
        self.denials.insert(kind, error);
        self
    }

    pub fn with_grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = delay;
        self
    }

    pub fn fail_stop(mut self, kind: DeviceKind) -> Self {
        self.stop_failures.insert(kind);
        self
    }

    pub fn end_on_grant(mut self, kind: DeviceKind) -> Self {
        self.ended_on_grant.insert(kind);
        self
    }
}

/// A platform whose devices exist only in memory.
pub struct SyntheticPlatform {
    config: Mutex<SyntheticConfig>,
    live_tracks: Arc<AtomicUsize>,
    request_log: Mutex<Vec<DeviceKind>>,
    recorders: Mutex<Vec<Arc<SyntheticRecorder>>>,
    scheduler: Arc<dyn FrameScheduler>,
}

impl SyntheticPlatform {
    pub fn new(config: SyntheticConfig) -> Self {
        let fps = if config.frame_rate == 0 {
            30
        } else {
            config.frame_rate
        };
        Self {
            config: Mutex::new(config),
            live_tracks: Arc::new(AtomicUsize::new(0)),
            request_log: Mutex::new(Vec::new()),
            recorders: Mutex::new(Vec::new()),
            scheduler: Arc::new(IntervalFrameScheduler::new(fps)),
        }
    }

    /// Drive compositing from `scheduler` instead of a timer.
    pub fn with_scheduler(config: SyntheticConfig, scheduler: Arc<dyn FrameScheduler>) -> Self {
        Self {
            scheduler,
            ..Self::new(config)
        }
    }

    /// Lift a configured denial, as if the user changed their settings.
    pub fn allow(&self, kind: DeviceKind) {
        self.config.lock().denials.remove(&kind);
    }

    /// Every capture request made so far, in order.
    pub fn request_log(&self) -> Vec<DeviceKind> {
        self.request_log.lock().clone()
    }

    /// Tracks granted and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    pub fn recorder_count(&self) -> usize {
        self.recorders.lock().len()
    }

    pub fn last_recorder(&self) -> Option<Arc<SyntheticRecorder>> {
        self.recorders.lock().last().cloned()
    }
}

#[async_trait::async_trait]
impl MediaPlatform for SyntheticPlatform {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn request_capture(
        &self,
        kind: DeviceKind,
        constraints: &CaptureConstraints,
    ) -> PlatformResult<Arc<dyn MediaStream>> {
        self.request_log.lock().push(kind);
        let delay = self.config.lock().grant_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let config = self.config.lock().clone();
        if let Some(error) = config.denials.get(&kind) {
            return Err(error.clone());
        }

        let stream = SyntheticStream::new(
            kind,
            constraints,
            self.live_tracks.clone(),
            config.stop_failures.contains(&kind),
        );
        if config.ended_on_grant.contains(&kind) {
            stream.end();
        }
        tracing::debug!(%kind, stream = stream.id(), "Synthetic capture granted");
        Ok(Arc::new(stream) as Arc<dyn MediaStream>)
    }

    fn create_recorder(
        &self,
        inputs: &[Arc<dyn MediaStream>],
        options: &RecorderOptions,
    ) -> PlatformResult<Arc<dyn MediaRecorder>> {
        if inputs.is_empty() {
            return Err(PlatformError::invalid_state("Recorder needs at least one input"));
        }
        if let Some(ended) = inputs.iter().find(|input| input.is_ended()) {
            return Err(PlatformError::invalid_state(format!(
                "Input stream {} has ended",
                ended.id()
            )));
        }

        let video = match inputs.iter().find(|input| input.has_video()) {
            Some(input) => {
                let source = input.frame_source().ok_or_else(|| {
                    PlatformError::not_supported(format!(
                        "Stream {} exposes no frames to record",
                        input.id()
                    ))
                })?;
                let frame = source.current_frame().ok_or_else(|| {
                    PlatformError::invalid_state(format!("Stream {} has no frame yet", input.id()))
                })?;
                Some(VideoInput {
                    source,
                    width: frame.width,
                    height: frame.height,
                })
            }
            None => None,
        };
        let audio = inputs.iter().any(|input| input.has_audio());

        let recorder = SyntheticRecorder::new(video, audio, options);
        self.recorders.lock().push(recorder.clone());
        Ok(recorder as Arc<dyn MediaRecorder>)
    }

    fn frame_scheduler(&self) -> Arc<dyn FrameScheduler> {
        self.scheduler.clone()
    }
}

struct FrameGenerator {
    width: u32,
    height: u32,
    colour: [u8; 4],
    epoch: Instant,
    ended: Arc<AtomicBool>,
}

impl FrameSource for FrameGenerator {
    fn current_frame(&self) -> Option<Frame> {
        if self.ended.load(Ordering::SeqCst) || self.width == 0 || self.height == 0 {
            return None;
        }
        let step = (self.epoch.elapsed().as_millis() / 33) as u32;
        let bar_x = step % self.width;
        let bar_w = (self.width / 16).max(1);

        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for _ in 0..self.height {
            for x in 0..self.width {
                let on_bar = x >= bar_x && x < bar_x + bar_w;
                pixels.extend_from_slice(if on_bar {
                    &[255, 255, 255, 255]
                } else {
                    &self.colour
                });
            }
        }
        Some(Frame::new(self.width, self.height, pixels))
    }
}

/// One synthetic device stream with a single track.
pub struct SyntheticStream {
    id: String,
    kind: DeviceKind,
    ended: Arc<AtomicBool>,
    live_tracks: Arc<AtomicUsize>,
    fail_stop: bool,
    frames: Option<Arc<FrameGenerator>>,
}

impl SyntheticStream {
    fn new(
        kind: DeviceKind,
        constraints: &CaptureConstraints,
        live_tracks: Arc<AtomicUsize>,
        fail_stop: bool,
    ) -> Self {
        let ended = Arc::new(AtomicBool::new(false));
        let frames = kind.is_video().then(|| {
            Arc::new(FrameGenerator {
                width: constraints.width,
                height: constraints.height,
                colour: match kind {
                    DeviceKind::Camera => [200, 80, 40, 255],
                    _ => [40, 90, 200, 255],
                },
                epoch: Instant::now(),
                ended: ended.clone(),
            })
        });
        live_tracks.fetch_add(1, Ordering::SeqCst);
        Self {
            id: format!("synthetic-{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            ended,
            live_tracks,
            fail_stop,
            frames,
        }
    }

    fn end(&self) -> bool {
        let first = !self.ended.swap(true, Ordering::SeqCst);
        if first {
            self.live_tracks.fetch_sub(1, Ordering::SeqCst);
        }
        first
    }
}

impl MediaStream for SyntheticStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn device(&self) -> Option<DeviceKind> {
        Some(self.kind)
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        vec![TrackInfo {
            label: format!("synthetic {}", self.kind),
            is_video: self.kind.is_video(),
            state: if self.ended.load(Ordering::SeqCst) {
                TrackState::Ended
            } else {
                TrackState::Live
            },
        }]
    }

    fn stop(&self) -> PlatformResult<()> {
        if self.end() && self.fail_stop {
            return Err(PlatformError::new(
                PlatformError::NOT_READABLE,
                format!("{} did not acknowledge stop", self.id),
            ));
        }
        Ok(())
    }

    fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        self.frames
            .clone()
            .map(|frames| frames as Arc<dyn FrameSource>)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct VideoInput {
    source: Arc<dyn FrameSource>,
    width: u32,
    height: u32,
}

/// Recorder producing YUV4MPEG2 (video) or WAV (audio only).
pub struct SyntheticRecorder {
    me: Weak<SyntheticRecorder>,
    handlers: RecorderHandlers,
    video: Option<VideoInput>,
    audio: bool,
    fps: u32,
    sample_rate: u32,
    state: Mutex<RecorderState>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    frames_encoded: AtomicU64,
}

impl SyntheticRecorder {
    fn new(video: Option<VideoInput>, audio: bool, options: &RecorderOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            handlers: RecorderHandlers::new(),
            video,
            audio,
            fps: options.fps.max(1),
            sample_rate: 48_000,
            state: Mutex::new(RecorderState::Inactive),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
            frames_encoded: AtomicU64::new(0),
        })
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    /// Report a fatal recorder error, as a platform encoder would.
    pub fn fail(&self, error: PlatformError) {
        *self.state.lock() = RecorderState::Inactive;
        self.stop_tx.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.handlers.emit(RecorderEvent::Error(error));
    }

    fn header(&self) -> Vec<u8> {
        match &self.video {
            Some(video) => format!(
                "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444\n",
                video.width, video.height, self.fps
            )
            .into_bytes(),
            None => wav_header(self.sample_rate),
        }
    }

    /// Append one frame period of media to `out`.
    fn encode_tick(&self, index: u64, out: &mut Vec<u8>) {
        match &self.video {
            Some(video) => {
                let frame = video
                    .source
                    .current_frame()
                    .filter(|frame| frame.width == video.width && frame.height == video.height)
                    .unwrap_or_else(|| Frame::solid(video.width, video.height, [0, 0, 0, 255]));
                out.extend_from_slice(b"FRAME\n");
                encode_yuv444(&frame, out);
            }
            None => {
                let per_tick = u64::from(self.sample_rate / self.fps);
                let start = index * per_tick;
                for n in start..start + per_tick {
                    let t = n as f64 / f64::from(self.sample_rate);
                    let sample = ((t * TONE_HZ * std::f64::consts::TAU).sin() * 6553.0) as i16;
                    out.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }
}

impl MediaRecorder for SyntheticRecorder {
    fn mime_type(&self) -> &str {
        if self.video.is_some() {
            Y4M_MIME
        } else {
            WAV_MIME
        }
    }

    fn state(&self) -> RecorderState {
        *self.state.lock()
    }

    fn start(&self, timeslice: Duration) -> PlatformResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PlatformError::invalid_state("Synthetic recorder needs a tokio runtime"))?;
        {
            let mut state = self.state.lock();
            if *state == RecorderState::Recording {
                return Err(PlatformError::invalid_state("Recorder already started"));
            }
            *state = RecorderState::Recording;
        }
        if self.video.is_none() && !self.audio {
            tracing::debug!("Synthetic recorder has no media inputs; emitting headers only");
        }
        self.handlers.emit(RecorderEvent::Start);

        let (stop_tx, mut stop_rx) = oneshot::channel();
        *self.stop_tx.lock() = Some(stop_tx);
        let weak = self.me.clone();
        let frame_interval = Duration::from_nanos(1_000_000_000 / u64::from(self.fps));
        let task = runtime.spawn(async move {
            let mut pending = match weak.upgrade() {
                Some(recorder) => recorder.header(),
                None => return,
            };
            let mut flush = ChunkPacer::new(timeslice);
            let mut ticker = tokio::time::interval(frame_interval);
            let started = Instant::now();
            let mut index = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(recorder) = weak.upgrade() else { return };
                        recorder.encode_tick(index, &mut pending);
                        index += 1;
                        if flush.due(started.elapsed()) {
                            recorder
                                .handlers
                                .emit(RecorderEvent::DataAvailable(std::mem::take(&mut pending)));
                        }
                    }
                    _ = &mut stop_rx => {
                        let Some(recorder) = weak.upgrade() else { return };
                        *recorder.state.lock() = RecorderState::Inactive;
                        recorder
                            .handlers
                            .emit(RecorderEvent::DataAvailable(std::mem::take(&mut pending)));
                        recorder.handlers.emit(RecorderEvent::Stop);
                        return;
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    fn stop(&self) -> PlatformResult<()> {
        if *self.state.lock() != RecorderState::Recording {
            return Err(PlatformError::invalid_state("Recorder is not recording"));
        }
        if let Some(stop) = self.stop_tx.lock().take() {
            let _ = stop.send(());
        }
        Ok(())
    }

    fn handlers(&self) -> &RecorderHandlers {
        &self.handlers
    }
}

impl Drop for SyntheticRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// 16-bit mono PCM header with streaming (unknown) sizes.
fn wav_header(sample_rate: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    header.extend_from_slice(b"WAVEfmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    header.extend_from_slice(&2u16.to_le_bytes());
    header.extend_from_slice(&16u16.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    header
}

/// Planar 4:4:4 BT.601 conversion of an RGBA frame.
fn encode_yuv444(frame: &Frame, out: &mut Vec<u8>) {
    let pixels = frame.pixels.chunks_exact(4);
    let len = pixels.len();
    let mut u_plane = Vec::with_capacity(len);
    let mut v_plane = Vec::with_capacity(len);
    out.reserve(len * 3);
    for px in pixels {
        let (r, g, b) = (i32::from(px[0]), i32::from(px[1]), i32::from(px[2]));
        out.push((((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8);
        u_plane.push((((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8);
        v_plane.push((((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8);
    }
    out.extend_from_slice(&u_plane);
    out.extend_from_slice(&v_plane);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints() -> CaptureConstraints {
        CaptureConstraints {
            width: 8,
            height: 4,
            fps: 10,
            ..CaptureConstraints::default()
        }
    }

    #[test]
    fn yuv_conversion_of_primaries() {
        let mut out = Vec::new();
        encode_yuv444(&Frame::solid(1, 1, [255, 255, 255, 255]), &mut out);
        assert_eq!(out, vec![235, 128, 128]);

        out.clear();
        encode_yuv444(&Frame::solid(1, 1, [0, 0, 0, 255]), &mut out);
        assert_eq!(out, vec![16, 128, 128]);
    }

    #[test]
    fn wav_header_is_44_bytes() {
        let header = wav_header(48_000);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[36..40], b"data");
    }

    #[tokio::test]
    async fn denied_kind_fails_and_is_logged() {
        let platform = SyntheticPlatform::new(
            SyntheticConfig::default().deny(DeviceKind::Camera, PlatformError::not_allowed("no")),
        );
        let err = platform
            .request_capture(DeviceKind::Camera, &constraints())
            .await
            .err()
            .unwrap();
        assert_eq!(err.name, PlatformError::NOT_ALLOWED);
        assert_eq!(platform.request_log(), vec![DeviceKind::Camera]);
        assert_eq!(platform.live_tracks(), 0);

        platform.allow(DeviceKind::Camera);
        let stream = platform
            .request_capture(DeviceKind::Camera, &constraints())
            .await
            .unwrap();
        assert_eq!(platform.live_tracks(), 1);
        stream.stop().unwrap();
        stream.stop().unwrap();
        assert_eq!(platform.live_tracks(), 0);
        assert!(stream.is_ended());
    }

    #[tokio::test]
    async fn video_streams_expose_frames() {
        let platform = SyntheticPlatform::new(SyntheticConfig::default());
        let screen = platform
            .request_capture(DeviceKind::Screen, &constraints())
            .await
            .unwrap();
        let mic = platform
            .request_capture(DeviceKind::Microphone, &constraints())
            .await
            .unwrap();

        let frame = screen.frame_source().unwrap().current_frame().unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        assert!(mic.frame_source().is_none());
        assert!(mic.has_audio());
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_emits_header_then_frames_and_stops() {
        let platform = SyntheticPlatform::new(SyntheticConfig::default());
        let camera = platform
            .request_capture(DeviceKind::Camera, &constraints())
            .await
            .unwrap();
        let options = RecorderOptions {
            fps: 10,
            timeslice: Duration::from_millis(500),
            ..RecorderOptions::default()
        };
        let recorder = platform.create_recorder(&[camera], &options).unwrap();

        let chunks = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let sink = chunks.clone();
        recorder.handlers().set(
            capsule_platform_core::RecorderEventKind::DataAvailable,
            Arc::new(move |event| {
                if let RecorderEvent::DataAvailable(bytes) = event {
                    sink.lock().push(bytes);
                }
            }),
        );
        let flag = stopped.clone();
        recorder.handlers().set(
            capsule_platform_core::RecorderEventKind::Stop,
            Arc::new(move |_| flag.store(true, Ordering::SeqCst)),
        );

        recorder.start(options.timeslice).unwrap();
        tokio::time::sleep(Duration::from_millis(1250)).await;
        recorder.stop().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(recorder.state(), RecorderState::Inactive);
        let data: Vec<u8> = chunks.lock().concat();
        assert!(data.starts_with(b"YUV4MPEG2 W8 H4 F10:1"));
        let frame_len = b"FRAME\n".len() + 8 * 4 * 3;
        let header_len = data.iter().position(|b| *b == b'\n').unwrap() + 1;
        assert_eq!((data.len() - header_len) % frame_len, 0);
        assert!(chunks.lock().len() >= 3);
        assert!(recorder.stop().is_err());
    }

    #[tokio::test]
    async fn recorder_rejects_ended_input() {
        let platform = SyntheticPlatform::new(
            SyntheticConfig::default().end_on_grant(DeviceKind::Microphone),
        );
        let mic = platform
            .request_capture(DeviceKind::Microphone, &constraints())
            .await
            .unwrap();
        assert!(mic.is_ended());
        let err = platform
            .create_recorder(&[mic], &RecorderOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.name, PlatformError::INVALID_STATE);
    }
}
