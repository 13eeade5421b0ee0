//! GStreamer capture backend.
//!
//! Each device runs in its own pipeline ending in an `intervideosink` or
//! `interaudiosink`; the recorder is a separate pipeline that reads those
//! channels back, composites video natively when there is more than one
//! source, and muxes WebM into a scratch file. The muxed file is delivered
//! as one data-available event when the recorder stops.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use capsule_common::kind::DeviceKind;
use capsule_platform_core::{
    CaptureConstraints, FrameScheduler, MediaPlatform, MediaRecorder, MediaStream, PlatformError,
    PlatformResult, RecorderEvent, RecorderHandlers, RecorderOptions, RecorderState, TrackInfo,
    TrackState,
};
use gst::prelude::*;
use gstreamer as gst;
use parking_lot::Mutex;
use uuid::Uuid;

use super::scheduler::IntervalFrameScheduler;
use crate::compositor::picture_in_picture;

pub const WEBM_MIME: &str = "video/webm";

const STATE_TIMEOUT: Duration = Duration::from_secs(10);
const EOS_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialise GStreamer once per process.
pub fn init_gstreamer() -> PlatformResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let init_res = GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string()));
    match init_res {
        Ok(()) => Ok(()),
        Err(e) => Err(PlatformError::not_supported(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

/// GStreamer version string, if the library initialises.
pub fn gstreamer_version() -> Option<String> {
    init_gstreamer().ok()?;
    Some(gst::version_string().to_string())
}

/// Whether a named element factory is installed.
pub fn has_element(name: &str) -> bool {
    init_gstreamer().is_ok() && gst::ElementFactory::find(name).is_some()
}

/// Elements the backend needs, paired with the plugin set that ships them.
pub const REQUIRED_ELEMENTS: &[(&str, &str)] = &[
    ("v4l2src", "gst-plugins-good"),
    ("ximagesrc", "gst-plugins-good"),
    ("pulsesrc", "gst-plugins-good"),
    ("intervideosink", "gst-plugins-bad"),
    ("interaudiosink", "gst-plugins-bad"),
    ("compositor", "gst-plugins-base"),
    ("vp8enc", "gst-plugins-good"),
    ("opusenc", "gst-plugins-base"),
    ("webmmux", "gst-plugins-good"),
];

struct GstPipeline {
    name: String,
    pipeline: gst::Pipeline,
}

impl GstPipeline {
    fn from_launch(name: impl Into<String>, launch: &str) -> PlatformResult<Self> {
        init_gstreamer()?;
        let name = name.into();
        tracing::debug!(pipeline = %name, %launch, "Building pipeline");

        let element = gst::parse::launch(launch).map_err(|e| {
            PlatformError::not_supported(format!("Failed to build {name} pipeline: {e}"))
        })?;
        let pipeline = element.dynamic_cast::<gst::Pipeline>().map_err(|_| {
            PlatformError::not_supported(format!("{name} launch string did not produce a pipeline"))
        })?;
        Ok(Self { name, pipeline })
    }

    /// Move to Playing and wait for the state change to settle.
    fn play(&self) -> PlatformResult<()> {
        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            self.release();
            return Err(self
                .bus_error()
                .unwrap_or_else(|| PlatformError::new(PlatformError::NOT_READABLE, format!(
                    "Failed to start {} pipeline: {e:?}",
                    self.name
                ))));
        }

        let wait_result = self
            .pipeline
            .state(gst::ClockTime::from_nseconds(STATE_TIMEOUT.as_nanos() as u64));
        match wait_result {
            (Ok(_), gst::State::Playing, _) => Ok(()),
            (Ok(_), state, _) => {
                tracing::warn!(
                    pipeline = %self.name,
                    ?state,
                    "Pipeline did not reach Playing state within timeout"
                );
                Ok(())
            }
            (Err(e), _, _) => {
                let error = self.bus_error().unwrap_or_else(|| {
                    PlatformError::new(
                        PlatformError::NOT_READABLE,
                        format!("{} pipeline failed to reach Playing state: {e:?}", self.name),
                    )
                });
                self.release();
                Err(error)
            }
        }
    }

    /// First error message waiting on the bus, classified.
    fn bus_error(&self) -> Option<PlatformError> {
        let bus = self.pipeline.bus()?;
        while let Some(msg) = bus.pop() {
            if let gst::MessageView::Error(e) = msg.view() {
                return Some(classify_bus_error(&e.error().to_string()));
            }
        }
        None
    }

    /// Send EOS so muxers finalise, wait for it to drain, then stop.
    fn drain_and_stop(&self) -> PlatformResult<()> {
        let eos_sent = self.pipeline.send_event(gst::event::Eos::new());
        if !eos_sent {
            tracing::warn!(pipeline = %self.name, "Failed to send EOS event; output may be truncated");
        } else if let Some(bus) = self.pipeline.bus() {
            let start = std::time::Instant::now();
            loop {
                let elapsed = start.elapsed();
                if elapsed >= EOS_TIMEOUT {
                    tracing::warn!(pipeline = %self.name, "EOS drain timed out");
                    break;
                }
                let remaining = gst::ClockTime::from_nseconds((EOS_TIMEOUT - elapsed).as_nanos() as u64);
                match bus.timed_pop(remaining) {
                    Some(msg) => match msg.view() {
                        gst::MessageView::Eos(_) => {
                            tracing::debug!(pipeline = %self.name, "EOS received; pipeline drained");
                            break;
                        }
                        gst::MessageView::Error(e) => {
                            tracing::warn!(
                                pipeline = %self.name,
                                error = %e.error(),
                                "Pipeline error during EOS drain"
                            );
                            break;
                        }
                        _ => {}
                    },
                    None => {
                        tracing::warn!(pipeline = %self.name, "EOS drain timed out");
                        break;
                    }
                }
            }
        }
        self.stop_now()
    }

    fn stop_now(&self) -> PlatformResult<()> {
        self.pipeline.set_state(gst::State::Null).map_err(|e| {
            PlatformError::invalid_state(format!("Failed to stop {} pipeline: {e:?}", self.name))
        })?;
        Ok(())
    }

    /// Best-effort move to Null; failures are logged.
    fn release(&self) {
        if let Err(e) = self.stop_now() {
            tracing::warn!(pipeline = %self.name, error = %e, "Pipeline not released");
        }
    }
}

/// A pipeline that goes out of scope returns to Null, whichever path
/// dropped it (a cancelled capture request, a panicked start, teardown).
impl Drop for GstPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

fn classify_bus_error(message: &str) -> PlatformError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        PlatformError::not_allowed(message)
    } else if lower.contains("no such") || lower.contains("not found") || lower.contains("cannot identify device") {
        PlatformError::not_found(message)
    } else {
        PlatformError::new(PlatformError::NOT_READABLE, message)
    }
}

/// A live device pipeline feeding an inter-pipeline channel.
pub struct GstStream {
    id: String,
    kind: DeviceKind,
    channel: String,
    width: u32,
    height: u32,
    pipeline: GstPipeline,
    ended: AtomicBool,
}

impl GstStream {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl MediaStream for GstStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn device(&self) -> Option<DeviceKind> {
        Some(self.kind)
    }

    fn tracks(&self) -> Vec<TrackInfo> {
        vec![TrackInfo {
            label: format!("{} ({})", self.kind, self.pipeline.name),
            is_video: self.kind.is_video(),
            state: if self.ended.load(Ordering::SeqCst) {
                TrackState::Ended
            } else {
                TrackState::Live
            },
        }]
    }

    fn stop(&self) -> PlatformResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pipeline.stop_now()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Records inter-pipeline channels to a WebM scratch file.
pub struct GstRecorder {
    me: Weak<GstRecorder>,
    handlers: RecorderHandlers,
    pipeline: Mutex<Option<GstPipeline>>,
    output: PathBuf,
    state: Mutex<RecorderState>,
}

impl GstRecorder {
    fn finish(&self, pipeline: GstPipeline) {
        if let Err(e) = pipeline.drain_and_stop() {
            tracing::warn!(error = %e, "Recorder pipeline did not stop cleanly");
        }
        *self.state.lock() = RecorderState::Inactive;
        match std::fs::read(&self.output) {
            Ok(bytes) => {
                self.handlers.emit(RecorderEvent::DataAvailable(bytes));
                self.handlers.emit(RecorderEvent::Stop);
            }
            Err(e) => {
                self.handlers.emit(RecorderEvent::Error(PlatformError::new(
                    PlatformError::NOT_READABLE,
                    format!("Failed to read {}: {e}", self.output.display()),
                )));
            }
        }
        if let Err(e) = std::fs::remove_file(&self.output) {
            tracing::debug!(path = %self.output.display(), error = %e, "Scratch file not removed");
        }
    }
}

impl MediaRecorder for GstRecorder {
    fn mime_type(&self) -> &str {
        WEBM_MIME
    }

    fn state(&self) -> RecorderState {
        *self.state.lock()
    }

    fn start(&self, timeslice: Duration) -> PlatformResult<()> {
        let pipeline = self.pipeline.lock();
        let pipeline = pipeline
            .as_ref()
            .ok_or_else(|| PlatformError::invalid_state("Recorder already used"))?;
        pipeline.play()?;
        *self.state.lock() = RecorderState::Recording;
        tracing::debug!(
            output = %self.output.display(),
            timeslice_ms = timeslice.as_millis() as u64,
            "GStreamer recorder started"
        );
        self.handlers.emit(RecorderEvent::Start);
        Ok(())
    }

    fn delivers_chunks(&self) -> bool {
        false
    }

    fn stop(&self) -> PlatformResult<()> {
        if *self.state.lock() != RecorderState::Recording {
            return Err(PlatformError::invalid_state("Recorder is not recording"));
        }
        let Some(pipeline) = self.pipeline.lock().take() else {
            return Ok(());
        };
        let Some(recorder) = self.me.upgrade() else {
            return pipeline.stop_now();
        };
        std::thread::Builder::new()
            .name("capsule-gst-recorder-stop".to_string())
            .spawn(move || recorder.finish(pipeline))
            .map_err(|e| PlatformError::invalid_state(format!("Failed to spawn stop thread: {e}")))?;
        Ok(())
    }

    fn handlers(&self) -> &RecorderHandlers {
        &self.handlers
    }
}

impl Drop for GstRecorder {
    fn drop(&mut self) {
        drop(self.pipeline.get_mut().take());
        match std::fs::remove_file(&self.output) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.output.display(), error = %e, "Scratch file not removed")
            }
        }
    }
}

/// Platform backed by GStreamer sources on Linux.
pub struct GstPlatform {
    scheduler: Arc<IntervalFrameScheduler>,
    scratch_dir: PathBuf,
}

impl GstPlatform {
    pub fn new(fps: u32, scratch_dir: PathBuf) -> PlatformResult<Self> {
        init_gstreamer()?;
        std::fs::create_dir_all(&scratch_dir).map_err(|e| {
            PlatformError::invalid_state(format!(
                "Cannot create scratch directory {}: {e}",
                scratch_dir.display()
            ))
        })?;
        Ok(Self {
            scheduler: Arc::new(IntervalFrameScheduler::new(fps)),
            scratch_dir,
        })
    }
}

#[async_trait::async_trait]
impl MediaPlatform for GstPlatform {
    fn name(&self) -> &str {
        "gstreamer"
    }

    async fn request_capture(
        &self,
        kind: DeviceKind,
        constraints: &CaptureConstraints,
    ) -> PlatformResult<Arc<dyn MediaStream>> {
        let channel = format!("capsule-{kind}-{}", Uuid::new_v4().simple());
        let launch = device_launch(kind, constraints, &channel)?;
        let pipeline = GstPipeline::from_launch(kind.as_str(), &launch)?;

        let pipeline = tokio::task::spawn_blocking(move || pipeline.play().map(|()| pipeline))
            .await
            .map_err(|e| PlatformError::new(PlatformError::ABORT, e.to_string()))??;

        tracing::info!(%kind, %channel, "GStreamer capture started");
        Ok(Arc::new(GstStream {
            id: format!("gst-{channel}"),
            kind,
            channel,
            width: constraints.width,
            height: constraints.height,
            pipeline,
            ended: AtomicBool::new(false),
        }) as Arc<dyn MediaStream>)
    }

    fn create_recorder(
        &self,
        inputs: &[Arc<dyn MediaStream>],
        _options: &RecorderOptions,
    ) -> PlatformResult<Arc<dyn MediaRecorder>> {
        let mut streams = Vec::with_capacity(inputs.len());
        for input in inputs {
            let stream = input.as_any().downcast_ref::<GstStream>().ok_or_else(|| {
                PlatformError::not_supported(format!(
                    "Stream {} was not produced by the GStreamer backend",
                    input.id()
                ))
            })?;
            if stream.is_ended() {
                return Err(PlatformError::invalid_state(format!(
                    "Input stream {} has ended",
                    stream.id()
                )));
            }
            streams.push(stream);
        }

        let output = self
            .scratch_dir
            .join(format!("recording-{}.webm", Uuid::new_v4().simple()));
        let launch = recorder_launch(&streams, &output)?;
        let pipeline = GstPipeline::from_launch("recorder", &launch)?;

        Ok(Arc::new_cyclic(|me| GstRecorder {
            me: me.clone(),
            handlers: RecorderHandlers::new(),
            pipeline: Mutex::new(Some(pipeline)),
            output,
            state: Mutex::new(RecorderState::Inactive),
        }) as Arc<dyn MediaRecorder>)
    }

    fn frame_scheduler(&self) -> Arc<dyn FrameScheduler> {
        self.scheduler.clone()
    }
}

fn device_launch(
    kind: DeviceKind,
    constraints: &CaptureConstraints,
    channel: &str,
) -> PlatformResult<String> {
    let (w, h, fps) = (constraints.width, constraints.height, constraints.fps.max(1));
    let launch = match kind {
        DeviceKind::Camera => {
            let device = match &constraints.device_id {
                Some(device) => device.clone(),
                None => default_webcam_device()
                    .ok_or_else(|| PlatformError::not_found("No webcam device found under /dev/video*"))?,
            };
            format!(
                "v4l2src device=\"{}\" do-timestamp=true ! videoconvert ! videoscale ! videorate ! video/x-raw,width={w},height={h},framerate={fps}/1 ! intervideosink channel={channel}",
                escape_path(Path::new(&device))
            )
        }
        DeviceKind::Screen => format!(
            "ximagesrc use-damage=false show-pointer=true ! queue max-size-buffers=200 leaky=downstream ! videoconvert ! videoscale ! videorate ! video/x-raw,width={w},height={h},framerate={fps}/1 ! intervideosink channel={channel}"
        ),
        DeviceKind::Microphone => {
            let device = constraints
                .device_id
                .as_ref()
                .map(|d| format!(" device=\"{}\"", d.replace('"', "\\\"")))
                .unwrap_or_default();
            format!(
                "pulsesrc{device} do-timestamp=true ! audioconvert ! audioresample ! audio/x-raw,rate={},channels=2 ! interaudiosink channel={channel}",
                constraints.sample_rate
            )
        }
    };
    Ok(launch)
}

fn recorder_launch(streams: &[&GstStream], output: &Path) -> PlatformResult<String> {
    let videos: Vec<&&GstStream> = streams.iter().filter(|s| s.kind.is_video()).collect();
    let audios: Vec<&&GstStream> = streams.iter().filter(|s| !s.kind.is_video()).collect();
    if videos.is_empty() && audios.is_empty() {
        return Err(PlatformError::invalid_state("Recorder needs at least one input"));
    }

    let mut parts = vec![format!(
        "webmmux name=mux ! filesink location=\"{}\"",
        escape_path(output)
    )];

    match videos.as_slice() {
        [] => {}
        [only] => parts.push(format!(
            "intervideosrc channel={} ! videoconvert ! queue ! vp8enc deadline=1 ! queue ! mux.",
            only.channel
        )),
        [first, ..] => {
            let (canvas_w, canvas_h) = (first.width, first.height);
            let layout = picture_in_picture(canvas_w, canvas_h, videos.len());
            let pads: Vec<String> = layout
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    format!(
                        "sink_{i}::xpos={} sink_{i}::ypos={} sink_{i}::width={} sink_{i}::height={} sink_{i}::zorder={i}",
                        p.x, p.y, p.width, p.height
                    )
                })
                .collect();
            parts.push(format!(
                "compositor name=comp {} ! video/x-raw,width={canvas_w},height={canvas_h} ! videoconvert ! queue ! vp8enc deadline=1 ! queue ! mux.",
                pads.join(" ")
            ));
            for (i, video) in videos.iter().enumerate() {
                parts.push(format!(
                    "intervideosrc channel={} ! videoconvert ! queue ! comp.sink_{i}",
                    video.channel
                ));
            }
        }
    }

    if audios.len() > 1 {
        let mut mix = String::from("audiomixer name=amix ! audioconvert ! opusenc ! queue ! mux.");
        for audio in &audios {
            mix.push_str(&format!(
                " interaudiosrc channel={} ! audioconvert ! audioresample ! amix.",
                audio.channel
            ));
        }
        parts.push(mix);
    } else if let Some(audio) = audios.first() {
        parts.push(format!(
            "interaudiosrc channel={} ! audioconvert ! audioresample ! opusenc ! queue ! mux.",
            audio.channel
        ));
    }

    Ok(parts.join(" "))
}

/// First `/dev/videoN` node that exists.
fn default_webcam_device() -> Option<String> {
    (0..16u32)
        .map(|idx| format!("/dev/video{idx}"))
        .find(|path| Path::new(path).exists())
}

fn escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('"', "\\\"")
}
