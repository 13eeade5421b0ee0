//! Recording sink: drives a platform recorder and accumulates its chunks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use capsule_common::error::{CapsuleError, CapsuleResult};
use capsule_platform_core::{
    Blob, MediaRecorder, PlatformError, RecorderEvent, RecorderEventKind, RecorderState,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of a [`RecordingSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    Idle,
    Acquiring,
    Ready,
    Recording,
    Stopping,
    Cleaned,
}

impl SinkState {
    pub fn is_terminal(self) -> bool {
        self == SinkState::Cleaned
    }

    fn can_advance_to(self, next: SinkState) -> bool {
        matches!(
            (self, next),
            (SinkState::Idle, SinkState::Acquiring)
                | (SinkState::Acquiring, SinkState::Ready)
                | (SinkState::Ready, SinkState::Recording)
                | (SinkState::Recording, SinkState::Stopping)
                | (SinkState::Stopping, SinkState::Cleaned)
        )
    }
}

/// The clip handed back by a stopped session.
#[derive(Debug, Clone)]
pub struct RawClip {
    pub blob: Blob,
    /// Time between recorder start and the stop event.
    pub duration: Duration,
    pub chunk_count: usize,
}

struct SinkInner {
    session_id: Uuid,
    state: Mutex<SinkState>,
    chunks: Mutex<Vec<Vec<u8>>>,
    recorder: Mutex<Option<Arc<dyn MediaRecorder>>>,
    started_at: Mutex<Option<Instant>>,
    stopped_at: Mutex<Option<Instant>>,
    last_error: Mutex<Option<PlatformError>>,
    stopped_tx: watch::Sender<bool>,
}

impl SinkInner {
    fn advance(&self, next: SinkState) -> CapsuleResult<()> {
        let mut state = self.state.lock();
        if !state.can_advance_to(next) {
            return Err(CapsuleError::capture(format!(
                "Invalid recording sink transition {:?} -> {next:?}",
                *state
            )));
        }
        tracing::debug!(session = %self.session_id, from = ?*state, to = ?next, "Sink state change");
        *state = next;
        Ok(())
    }

    fn on_data(&self, bytes: Vec<u8>) {
        if *self.state.lock() != SinkState::Recording {
            tracing::debug!(
                session = %self.session_id,
                bytes = bytes.len(),
                "Dropping chunk delivered outside recording"
            );
            return;
        }
        if !bytes.is_empty() {
            self.chunks.lock().push(bytes);
        }
    }

    fn on_stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == SinkState::Recording {
                *state = SinkState::Stopping;
            }
        }
        *self.stopped_at.lock() = Some(Instant::now());
        self.stopped_tx.send_replace(true);
    }
}

/// Wraps one platform recorder for the lifetime of a session.
///
/// Handler closures hold only a weak reference back to the sink, and
/// [`teardown`](Self::teardown) clears all of them.
#[derive(Clone)]
pub struct RecordingSink {
    inner: Arc<SinkInner>,
}

impl RecordingSink {
    pub fn new(session_id: Uuid) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SinkInner {
                session_id,
                state: Mutex::new(SinkState::Idle),
                chunks: Mutex::new(Vec::new()),
                recorder: Mutex::new(None),
                started_at: Mutex::new(None),
                stopped_at: Mutex::new(None),
                last_error: Mutex::new(None),
                stopped_tx,
            }),
        }
    }

    pub fn state(&self) -> SinkState {
        *self.inner.state.lock()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.chunks.lock().len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner.chunks.lock().iter().map(Vec::len).sum()
    }

    pub fn last_error(&self) -> Option<PlatformError> {
        self.inner.last_error.lock().clone()
    }

    pub fn recorder(&self) -> Option<Arc<dyn MediaRecorder>> {
        self.inner.recorder.lock().clone()
    }

    /// Mark the start of device acquisition.
    pub fn begin_acquire(&self) -> CapsuleResult<()> {
        self.inner.advance(SinkState::Acquiring)
    }

    /// Take ownership of `recorder` and install all four handlers.
    /// `on_failure` runs when the recorder reports an error.
    pub fn attach(
        &self,
        recorder: Arc<dyn MediaRecorder>,
        on_failure: impl Fn(PlatformError) + Send + Sync + 'static,
    ) -> CapsuleResult<()> {
        self.inner.advance(SinkState::Ready)?;
        let handlers = recorder.handlers();

        let session = self.inner.session_id;
        handlers.set(
            RecorderEventKind::Start,
            Arc::new(move |_| tracing::debug!(%session, "Recorder started")),
        );

        let weak: Weak<SinkInner> = Arc::downgrade(&self.inner);
        handlers.set(
            RecorderEventKind::DataAvailable,
            Arc::new(move |event| {
                if let (Some(inner), RecorderEvent::DataAvailable(bytes)) = (weak.upgrade(), event)
                {
                    inner.on_data(bytes);
                }
            }),
        );

        let weak: Weak<SinkInner> = Arc::downgrade(&self.inner);
        handlers.set(
            RecorderEventKind::Stop,
            Arc::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_stop();
                }
            }),
        );

        let weak: Weak<SinkInner> = Arc::downgrade(&self.inner);
        handlers.set(
            RecorderEventKind::Error,
            Arc::new(move |event| {
                let RecorderEvent::Error(error) = event else {
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                tracing::warn!(session = %inner.session_id, %error, "Recorder reported an error");
                *inner.last_error.lock() = Some(error.clone());
                inner.stopped_tx.send_replace(true);
                on_failure(error);
            }),
        );

        *self.inner.recorder.lock() = Some(recorder);
        Ok(())
    }

    /// Start recording, delivering a chunk every `timeslice`.
    pub fn start(&self, timeslice: Duration) -> CapsuleResult<()> {
        let recorder = self
            .recorder()
            .ok_or_else(|| CapsuleError::capture("Recording sink has no recorder"))?;
        self.inner.advance(SinkState::Recording)?;
        *self.inner.started_at.lock() = Some(Instant::now());
        recorder
            .start(timeslice)
            .map_err(|e| CapsuleError::capture(format!("Recorder failed to start: {e}")))?;
        if !recorder.delivers_chunks() {
            tracing::warn!(
                session = %self.inner.session_id,
                timeslice_ms = timeslice.as_millis() as u64,
                "Recorder ignores the chunk interval; data is delivered on stop"
            );
        }
        tracing::info!(
            session = %self.inner.session_id,
            mime = recorder.mime_type(),
            timeslice_ms = timeslice.as_millis() as u64,
            "Recording started"
        );
        Ok(())
    }

    /// Ask the recorder to stop and wait up to `timeout` for its stop event.
    /// Returns everything accumulated as one clip.
    pub async fn stop(&self, timeout: Duration) -> CapsuleResult<RawClip> {
        if self.state() != SinkState::Recording {
            return Err(CapsuleError::capture(format!(
                "Cannot stop a recording sink in state {:?}",
                self.state()
            )));
        }
        let recorder = self
            .recorder()
            .ok_or_else(|| CapsuleError::capture("Recording sink has no recorder"))?;

        let mut stopped = self.inner.stopped_tx.subscribe();
        recorder
            .stop()
            .map_err(|e| CapsuleError::capture(format!("Recorder failed to stop: {e}")))?;

        let waited = tokio::time::timeout(timeout, async {
            stopped.wait_for(|done| *done).await.map(|_| ())
        })
        .await;
        if waited.is_err() {
            tracing::warn!(
                session = %self.inner.session_id,
                timeout_ms = timeout.as_millis() as u64,
                "Recorder did not deliver its stop event in time; keeping buffered chunks"
            );
            self.inner.on_stop();
        }

        if let Some(error) = self.last_error() {
            return Err(CapsuleError::capture(format!("Recorder failed: {error}")));
        }

        let chunks = std::mem::take(&mut *self.inner.chunks.lock());
        let started = *self.inner.started_at.lock();
        let stopped_at = (*self.inner.stopped_at.lock()).unwrap_or_else(Instant::now);
        let duration = started
            .map(|s| stopped_at.saturating_duration_since(s))
            .unwrap_or_default();
        let clip = RawClip {
            blob: Blob::from_chunks(&chunks, recorder.mime_type()),
            duration,
            chunk_count: chunks.len(),
        };
        tracing::info!(
            session = %self.inner.session_id,
            bytes = clip.blob.size(),
            chunks = clip.chunk_count,
            duration_ms = clip.duration.as_millis() as u64,
            "Recording stopped"
        );
        Ok(clip)
    }

    /// Detach from the recorder: clear every handler, stop it if it is
    /// still running, and move to `Cleaned`. Idempotent.
    pub fn teardown(&self) -> CapsuleResult<()> {
        let recorder = self.inner.recorder.lock().take();
        let previous = std::mem::replace(&mut *self.inner.state.lock(), SinkState::Cleaned);
        self.inner.chunks.lock().clear();
        self.inner.stopped_tx.send_replace(true);

        let Some(recorder) = recorder else {
            return Ok(());
        };
        recorder.handlers().clear_all();
        tracing::debug!(session = %self.inner.session_id, from = ?previous, "Recording sink cleaned");
        if recorder.state() == RecorderState::Recording {
            recorder
                .stop()
                .map_err(|e| CapsuleError::platform(format!("Recorder stop on teardown: {e}")))?;
        }
        Ok(())
    }

    /// Abandon the recording from any state.
    pub fn fail(&self) {
        if self.state().is_terminal() {
            return;
        }
        tracing::warn!(session = %self.inner.session_id, state = ?self.state(), "Recording sink failed");
        if let Err(e) = self.teardown() {
            tracing::warn!(session = %self.inner.session_id, error = %e, "Sink teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::LogCapture;
    use capsule_platform_core::{PlatformResult, RecorderHandlers};

    /// Recorder that records calls and lets the test drive events.
    #[derive(Default)]
    struct ScriptedRecorder {
        handlers: RecorderHandlers,
        state: Mutex<Option<RecorderState>>,
        stop_calls: Mutex<usize>,
        emit_on_stop: bool,
        single_chunk: bool,
    }

    impl ScriptedRecorder {
        fn emitting() -> Self {
            Self {
                emit_on_stop: true,
                ..Self::default()
            }
        }
    }

    impl MediaRecorder for ScriptedRecorder {
        fn mime_type(&self) -> &str {
            "video/webm"
        }

        fn state(&self) -> RecorderState {
            self.state.lock().unwrap_or(RecorderState::Inactive)
        }

        fn start(&self, _timeslice: Duration) -> PlatformResult<()> {
            *self.state.lock() = Some(RecorderState::Recording);
            self.handlers.emit(RecorderEvent::Start);
            Ok(())
        }

        fn stop(&self) -> PlatformResult<()> {
            *self.stop_calls.lock() += 1;
            *self.state.lock() = Some(RecorderState::Inactive);
            if self.emit_on_stop {
                self.handlers.emit(RecorderEvent::DataAvailable(b"tail".to_vec()));
                self.handlers.emit(RecorderEvent::Stop);
            }
            Ok(())
        }

        fn handlers(&self) -> &RecorderHandlers {
            &self.handlers
        }

        fn delivers_chunks(&self) -> bool {
            !self.single_chunk
        }
    }

    fn ready_sink(recorder: Arc<ScriptedRecorder>) -> RecordingSink {
        let sink = RecordingSink::new(Uuid::new_v4());
        sink.begin_acquire().unwrap();
        sink.attach(recorder, |_| {}).unwrap();
        sink
    }

    #[tokio::test]
    async fn stop_collects_chunks_including_final_one() {
        let recorder = Arc::new(ScriptedRecorder::emitting());
        let sink = ready_sink(recorder.clone());
        sink.start(Duration::from_millis(100)).unwrap();

        recorder
            .handlers()
            .emit(RecorderEvent::DataAvailable(b"head-".to_vec()));
        let clip = sink.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(clip.blob.bytes(), b"head-tail");
        assert_eq!(clip.chunk_count, 2);
        assert_eq!(clip.blob.mime_type(), "video/webm");
        assert_eq!(sink.state(), SinkState::Stopping);
    }

    #[tokio::test]
    async fn chunks_after_stop_event_are_refused() {
        let recorder = Arc::new(ScriptedRecorder::emitting());
        let sink = ready_sink(recorder.clone());
        sink.start(Duration::from_millis(100)).unwrap();
        sink.stop(Duration::from_secs(1)).await.unwrap();

        recorder
            .handlers()
            .emit(RecorderEvent::DataAvailable(b"late".to_vec()));
        assert_eq!(sink.chunk_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_times_out_without_stop_event() {
        let recorder = Arc::new(ScriptedRecorder::default());
        let sink = ready_sink(recorder.clone());
        sink.start(Duration::from_millis(100)).unwrap();
        recorder
            .handlers()
            .emit(RecorderEvent::DataAvailable(b"only".to_vec()));

        let clip = sink.stop(Duration::from_millis(500)).await.unwrap();
        assert_eq!(clip.blob.bytes(), b"only");
        assert_eq!(sink.state(), SinkState::Stopping);
    }

    #[test]
    fn ignored_chunk_interval_is_reported_at_start() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let chunked = Arc::new(ScriptedRecorder::default());
        ready_sink(chunked).start(Duration::from_millis(250)).unwrap();
        assert!(!logs.contents().contains("ignores the chunk interval"));

        let whole = Arc::new(ScriptedRecorder {
            single_chunk: true,
            ..ScriptedRecorder::default()
        });
        let sink = ready_sink(whole);
        sink.start(Duration::from_millis(250)).unwrap();

        let output = logs.contents();
        assert!(output.contains("ignores the chunk interval"), "{output}");
        assert!(output.contains("timeslice_ms=250"), "{output}");
        assert_eq!(sink.state(), SinkState::Recording);
    }

    #[test]
    fn teardown_clears_every_handler() {
        let recorder = Arc::new(ScriptedRecorder::default());
        let sink = ready_sink(recorder.clone());
        assert_eq!(recorder.handlers().count(), 4);
        sink.start(Duration::from_millis(100)).unwrap();

        sink.teardown().unwrap();
        sink.teardown().unwrap();

        assert_eq!(recorder.handlers().count(), 0);
        assert_eq!(*recorder.stop_calls.lock(), 1);
        assert_eq!(sink.state(), SinkState::Cleaned);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let sink = RecordingSink::new(Uuid::new_v4());
        let recorder: Arc<dyn MediaRecorder> = Arc::new(ScriptedRecorder::default());
        assert!(sink.attach(recorder, |_| {}).is_err());
        assert!(sink.start(Duration::from_secs(1)).is_err());
        assert_eq!(sink.state(), SinkState::Idle);
    }

    #[test]
    fn fail_moves_any_state_to_cleaned() {
        let sink = RecordingSink::new(Uuid::new_v4());
        sink.begin_acquire().unwrap();
        sink.fail();
        assert_eq!(sink.state(), SinkState::Cleaned);
        assert!(sink.begin_acquire().is_err());
    }

    #[tokio::test]
    async fn recorder_error_invokes_failure_hook() {
        let recorder = Arc::new(ScriptedRecorder::default());
        let sink = RecordingSink::new(Uuid::new_v4());
        sink.begin_acquire().unwrap();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = failures.clone();
        sink.attach(recorder.clone(), move |e| seen.lock().push(e.name))
            .unwrap();
        sink.start(Duration::from_millis(100)).unwrap();

        recorder
            .handlers()
            .emit(RecorderEvent::Error(PlatformError::new("EncodingError", "boom")));

        assert_eq!(*failures.lock(), vec!["EncodingError".to_string()]);
        assert!(sink.stop(Duration::from_secs(1)).await.is_err());
    }
}
