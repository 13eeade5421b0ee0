//! Capture sessions and the manager that owns them.
//!
//! A session is built step by step (reserve devices, acquire streams,
//! composite, attach a recorder, start the timer). Every acquired resource
//! is registered with the session's [`ResourceRegistry`] the moment it
//! exists, and a session that is dropped before it is handed out releases
//! all of it. That makes rollback on any failure, and teardown when the
//! caller's future is cancelled, the same code path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use capsule_common::clock::SessionClock;
use capsule_common::config::CaptureDefaults;
use capsule_common::error::{CapsuleError, CapsuleResult};
use capsule_common::kind::{DeviceKind, ResourceKind};
use capsule_platform_core::{
    CaptureConstraints, FrameSource, MediaPlatform, MediaStream, RecorderOptions,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::acquirer::CaptureDeviceAcquirer;
use crate::cleanup::{CleanupCoordinator, CleanupReport};
use crate::compositor::{CompositeStream, FrameCompositor, PixelBuffer};
use crate::monitor::{MemorySample, MonitorService};
use crate::recorder::{RawClip, RecordingSink, SinkState};
use crate::registry::{ResourceHandle, ResourceRegistry};
use crate::timer::RecordingTimer;

/// What to capture.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub kinds: Vec<DeviceKind>,
    pub constraints: CaptureConstraints,
    pub recorder: RecorderOptions,
    /// Signal (through [`SessionManager::wait_for_limit`]) once this much
    /// has been recorded.
    pub max_duration: Option<Duration>,
}

impl SessionRequest {
    pub fn new(kinds: impl IntoIterator<Item = DeviceKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            constraints: CaptureConstraints::default(),
            recorder: RecorderOptions::default(),
            max_duration: None,
        }
    }

    /// Request seeded from configured capture defaults.
    pub fn from_defaults(
        kinds: impl IntoIterator<Item = DeviceKind>,
        defaults: &CaptureDefaults,
    ) -> Self {
        let mut request = Self::new(kinds);
        request.constraints.width = defaults.width;
        request.constraints.height = defaults.height;
        request.constraints.fps = defaults.fps;
        request.recorder.fps = defaults.fps;
        request.recorder.timeslice = Duration::from_millis(defaults.timeslice_ms.max(1));
        request
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.recorder.fps = constraints.fps;
        self.constraints = constraints;
        self
    }
}

/// Opaque reference to an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle {
    id: Uuid,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Snapshot of an active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub kinds: Vec<DeviceKind>,
    pub state: SinkState,
    pub started_at: String,
    pub elapsed_secs: f64,
    pub composited: bool,
    /// Canvas frames drawn so far; zero when not compositing.
    pub frames_drawn: u64,
}

/// Result of [`SessionManager::stop_session`].
#[derive(Debug, Clone)]
pub struct StoppedSession {
    pub clip: RawClip,
    pub cleanup: CleanupReport,
    /// Canvas frames drawn over the session; zero when not compositing.
    pub frames_drawn: u64,
}

/// Device reservations and monitor registration held by one session.
struct SessionLease {
    id: Uuid,
    manager: Weak<ManagerInner>,
    released: AtomicBool,
}

impl SessionLease {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager
                .reservations
                .lock()
                .retain(|_, holder| *holder != self.id);
            manager.monitor.stop(self.id);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release();
    }
}

struct CaptureSession {
    id: Uuid,
    kinds: Vec<DeviceKind>,
    clock: SessionClock,
    registry: ResourceRegistry,
    sink: RecordingSink,
    timer: Mutex<Option<Arc<RecordingTimer>>>,
    compositor: Mutex<Option<Arc<FrameCompositor>>>,
    coordinator: CleanupCoordinator,
    lease: SessionLease,
}

impl CaptureSession {
    fn register(&self, handle: ResourceHandle) -> CapsuleResult<()> {
        self.registry.register(handle).map(|_| ())
    }

    /// Release every resource, then the reservations. Idempotent.
    fn finish(&self) -> CleanupReport {
        let report = self.coordinator.release_all(&self.registry);
        self.sink.fail();
        self.lease.release();
        report
    }

    fn frames_drawn(&self) -> u64 {
        self.compositor
            .lock()
            .as_ref()
            .map_or(0, |compositor| compositor.frames_drawn())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kinds: self.kinds.clone(),
            state: self.sink.state(),
            started_at: self.clock.started_at(),
            elapsed_secs: self.clock.elapsed_secs(),
            composited: self.compositor.lock().is_some(),
            frames_drawn: self.frames_drawn(),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.registry.live_count() > 0 {
            tracing::debug!(session = %self.id, "Session dropped while holding resources");
        }
        self.finish();
    }
}

struct ManagerInner {
    platform: Arc<dyn MediaPlatform>,
    acquirer: CaptureDeviceAcquirer,
    monitor: MonitorService,
    defaults: CaptureDefaults,
    reservations: Mutex<HashMap<DeviceKind, Uuid>>,
    sessions: Mutex<HashMap<Uuid, Arc<CaptureSession>>>,
    /// Recorder failures for the reaper. Replaced whenever the reaper is
    /// (re)started.
    failure_tx: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ManagerInner {
    fn session(&self, id: Uuid) -> CapsuleResult<Arc<CaptureSession>> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CapsuleError::capture(format!("No active session {id}")))
    }

    fn abort(&self, id: Uuid) -> CleanupReport {
        let session = self.sessions.lock().remove(&id);
        match session {
            Some(session) => {
                let report = session.finish();
                tracing::info!(
                    session = %id,
                    released = report.released_count(),
                    failures = report.failures.len(),
                    "Session aborted"
                );
                report
            }
            None => CleanupReport::default(),
        }
    }
}

/// Owns every active capture session in the process.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        platform: Arc<dyn MediaPlatform>,
        monitor: MonitorService,
        defaults: CaptureDefaults,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                acquirer: CaptureDeviceAcquirer::new(platform.clone()),
                platform,
                monitor,
                defaults,
                reservations: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                failure_tx: Mutex::new(None),
                reaper: Mutex::new(None),
            }),
        }
    }

    pub fn monitor(&self) -> &MonitorService {
        &self.inner.monitor
    }

    pub fn acquirer(&self) -> &CaptureDeviceAcquirer {
        &self.inner.acquirer
    }

    /// Acquire every requested device and start recording.
    ///
    /// Device kinds are reserved before the first platform call, so an
    /// overlapping request for a held kind fails with `ResourceBusy`
    /// without touching the holder. On any failure everything acquired so
    /// far is released before the error is returned.
    pub async fn acquire_session(&self, request: SessionRequest) -> CapsuleResult<SessionHandle> {
        if request.kinds.is_empty() {
            return Err(CapsuleError::capture("A session needs at least one device"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = request.kinds.iter().find(|kind| !seen.insert(**kind)) {
            return Err(CapsuleError::busy(dup.resource_kind()));
        }

        let id = Uuid::new_v4();
        {
            let mut reservations = self.inner.reservations.lock();
            if let Some(kind) = request
                .kinds
                .iter()
                .find(|kind| reservations.contains_key(*kind))
            {
                tracing::warn!(session = %id, %kind, "Device already held by another session");
                return Err(CapsuleError::busy(kind.resource_kind()));
            }
            for kind in &request.kinds {
                reservations.insert(*kind, id);
            }
        }

        let session = Arc::new(CaptureSession {
            id,
            kinds: request.kinds.clone(),
            clock: SessionClock::start(),
            registry: ResourceRegistry::new(id),
            sink: RecordingSink::new(id),
            timer: Mutex::new(None),
            compositor: Mutex::new(None),
            coordinator: CleanupCoordinator::new(),
            lease: SessionLease {
                id,
                manager: Arc::downgrade(&self.inner),
                released: AtomicBool::new(false),
            },
        });

        self.ensure_reaper();
        self.build_session(&session, &request).await?;

        self.inner.monitor.start(id);
        self.inner.sessions.lock().insert(id, session);
        tracing::info!(
            session = %id,
            kinds = ?request.kinds,
            platform = self.inner.platform.name(),
            "Capture session started"
        );
        Ok(SessionHandle { id })
    }

    async fn build_session(
        &self,
        session: &CaptureSession,
        request: &SessionRequest,
    ) -> CapsuleResult<()> {
        session.sink.begin_acquire()?;

        let mut streams: Vec<Arc<dyn MediaStream>> = Vec::with_capacity(request.kinds.len());
        for kind in &request.kinds {
            let stream = self
                .inner
                .acquirer
                .acquire(*kind, &request.constraints)
                .await?;
            let release_stream = stream.clone();
            session.register(ResourceHandle::new(
                kind.resource_kind(),
                stream.id().to_string(),
                move || {
                    release_stream
                        .stop()
                        .map_err(|e| CapsuleError::platform(e.to_string()))
                },
            ))?;
            streams.push(stream);
        }

        let inputs = self.composite_if_needed(session, &streams, &request.constraints)?;

        let recorder = self
            .inner
            .platform
            .create_recorder(&inputs, &request.recorder)
            .map_err(|e| CapsuleError::capture(format!("Failed to create recorder: {e}")))?;
        let failures = self.inner.failure_tx.lock().clone();
        let id = session.id;
        session.sink.attach(recorder, move |_| {
            let delivered = failures.as_ref().is_some_and(|tx| tx.send(id).is_ok());
            if !delivered {
                tracing::debug!(session = %id, "Reaper gone; recorder failure not forwarded");
            }
        })?;
        let sink = session.sink.clone();
        session.register(ResourceHandle::new(ResourceKind::Recorder, "recorder", move || {
            sink.teardown()
        }))?;

        session.sink.start(request.recorder.timeslice)?;

        let timer = Arc::new(RecordingTimer::start(request.max_duration));
        let release_timer = timer.clone();
        session.register(ResourceHandle::new(
            ResourceKind::IntervalTimer,
            "recording-timer",
            move || {
                release_timer.cancel();
                Ok(())
            },
        ))?;
        *session.timer.lock() = Some(timer);
        Ok(())
    }

    /// Put two or more frame-exposing video streams onto one canvas.
    /// Returns the streams the recorder should consume.
    fn composite_if_needed(
        &self,
        session: &CaptureSession,
        streams: &[Arc<dyn MediaStream>],
        constraints: &CaptureConstraints,
    ) -> CapsuleResult<Vec<Arc<dyn MediaStream>>> {
        let video: Vec<&Arc<dyn MediaStream>> =
            streams.iter().filter(|stream| stream.has_video()).collect();
        let sources: Option<Vec<Arc<dyn FrameSource>>> = video
            .iter()
            .map(|stream| stream.frame_source())
            .collect();
        let sources = match sources {
            Some(sources) if sources.len() >= 2 => sources,
            _ => return Ok(streams.to_vec()),
        };

        let buffer = Arc::new(PixelBuffer::new(constraints.width, constraints.height));
        let release_buffer = buffer.clone();
        session.register(ResourceHandle::new(
            ResourceKind::FrameBuffer,
            format!("canvas-{}x{}", constraints.width, constraints.height),
            move || {
                release_buffer.release();
                Ok(())
            },
        ))?;

        let compositor = Arc::new(FrameCompositor::start(
            sources,
            buffer.clone(),
            self.inner.platform.frame_scheduler(),
        ));
        let release_compositor = compositor.clone();
        session.register(ResourceHandle::new(
            ResourceKind::AnimationLoop,
            "compositor",
            move || {
                release_compositor.stop();
                Ok(())
            },
        ))?;
        *session.compositor.lock() = Some(compositor);
        tracing::debug!(session = %session.id, videos = video.len(), "Compositing video sources");

        let mut inputs: Vec<Arc<dyn MediaStream>> = vec![Arc::new(CompositeStream::new(buffer))];
        inputs.extend(
            streams
                .iter()
                .filter(|stream| !stream.has_video())
                .cloned(),
        );
        Ok(inputs)
    }

    /// Start the reaper, or restart it after [`shutdown`](Self::shutdown).
    fn ensure_reaper(&self) {
        let mut reaper = self.inner.reaper.lock();
        if reaper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let (tx, mut failures) = mpsc::unbounded_channel();
        *self.inner.failure_tx.lock() = Some(tx);
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(id) = failures.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tracing::warn!(session = %id, "Recorder failed; aborting session");
                inner.abort(id);
            }
        });
        *reaper = Some(task);
    }

    /// Stop recording and release everything the session holds.
    ///
    /// The session leaves the active set before the recorder is asked to
    /// stop, so a concurrent stop or abort of the same handle finds nothing.
    pub async fn stop_session(&self, handle: SessionHandle) -> CapsuleResult<StoppedSession> {
        let session = self
            .inner
            .sessions
            .lock()
            .remove(&handle.id)
            .ok_or_else(|| CapsuleError::capture(format!("No active session {}", handle.id)))?;
        let timeout = Duration::from_millis(self.inner.defaults.stop_timeout_ms);
        let clip = session.sink.stop(timeout).await;

        let cleanup = session.finish();
        let frames_drawn = session.frames_drawn();
        drop(session);

        let clip = clip?;
        tracing::info!(
            session = %handle.id,
            bytes = clip.blob.size(),
            released = cleanup.released_count(),
            failures = cleanup.failures.len(),
            "Capture session stopped"
        );
        Ok(StoppedSession {
            clip,
            cleanup,
            frames_drawn,
        })
    }

    /// Tear a session down without producing a clip. Aborting an unknown
    /// or already finished session returns an empty report.
    pub fn abort_session(&self, handle: SessionHandle) -> CleanupReport {
        self.inner.abort(handle.id)
    }

    /// Resolves when the session's maximum duration is reached. Never
    /// resolves for sessions without one.
    pub async fn wait_for_limit(&self, handle: SessionHandle) -> CapsuleResult<()> {
        let timer = self
            .inner
            .session(handle.id)?
            .timer
            .lock()
            .clone()
            .ok_or_else(|| CapsuleError::capture("Session has no recording timer"))?;
        timer.limit_reached().await;
        Ok(())
    }

    /// Seconds recorded so far.
    pub fn elapsed_secs(&self, handle: SessionHandle) -> Option<u64> {
        let session = self.inner.sessions.lock().get(&handle.id).cloned()?;
        let timer = session.timer.lock().clone()?;
        Some(timer.elapsed_secs())
    }

    pub fn on_memory_warning(&self, callback: impl Fn(&MemorySample) + Send + Sync + 'static) {
        self.inner.monitor.on_memory_warning(callback);
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<CaptureSession>> =
            self.inner.sessions.lock().values().cloned().collect();
        sessions.iter().map(|session| session.info()).collect()
    }

    pub fn session_state(&self, id: Uuid) -> Option<SinkState> {
        let session = self.inner.sessions.lock().get(&id).cloned()?;
        Some(session.sink.state())
    }

    /// Which session holds `kind`, if any.
    pub fn holder_of(&self, kind: DeviceKind) -> Option<Uuid> {
        self.inner.reservations.lock().get(&kind).copied()
    }

    /// Abort every session.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<CaptureSession>> = self
            .inner
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.finish();
        }
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }
        self.inner.failure_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::synthetic::{SyntheticConfig, SyntheticPlatform};
    use crate::monitor::HeapProbe;
    use capsule_common::error::PermissionReason;
    use capsule_platform_core::PlatformError;

    struct IdleProbe;

    impl HeapProbe for IdleProbe {
        fn sample(&self) -> CapsuleResult<MemorySample> {
            Ok(MemorySample {
                timestamp: chrono::Utc::now(),
                used_bytes: 1,
                total_bytes: 100,
                limit_bytes: 100,
            })
        }
    }

    fn manager(platform: Arc<SyntheticPlatform>) -> SessionManager {
        let monitor = MonitorService::with_settings(Arc::new(IdleProbe), Duration::from_secs(5), 0.8);
        SessionManager::new(platform, monitor, CaptureDefaults::default())
    }

    fn small_request(kinds: impl IntoIterator<Item = DeviceKind>) -> SessionRequest {
        SessionRequest::new(kinds).with_constraints(CaptureConstraints {
            width: 32,
            height: 24,
            fps: 10,
            ..CaptureConstraints::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn empty_and_duplicate_requests_are_rejected() {
        let platform = Arc::new(SyntheticPlatform::new(SyntheticConfig::default()));
        let manager = manager(platform.clone());

        assert!(manager.acquire_session(SessionRequest::new([])).await.is_err());
        let err = manager
            .acquire_session(small_request([DeviceKind::Camera, DeviceKind::Camera]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapsuleError::ResourceBusy {
                kind: ResourceKind::CameraStream
            }
        ));
        assert!(platform.request_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_acquisition_rolls_back_earlier_streams() {
        let platform = Arc::new(SyntheticPlatform::new(
            SyntheticConfig::default()
                .deny(DeviceKind::Screen, PlatformError::not_allowed("blocked")),
        ));
        let manager = manager(platform.clone());

        let err = manager
            .acquire_session(small_request([DeviceKind::Microphone, DeviceKind::Screen]))
            .await
            .unwrap_err();

        match err {
            CapsuleError::Permission(e) => {
                assert_eq!(e.kind, DeviceKind::Screen);
                assert_eq!(e.reason, PermissionReason::NotAllowed);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(platform.live_tracks(), 0);
        assert!(manager.holder_of(DeviceKind::Microphone).is_none());
        assert!(manager.active_sessions().is_empty());
        assert!(!manager.monitor().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn two_cameras_are_composited() {
        let platform = Arc::new(SyntheticPlatform::new(SyntheticConfig::default()));
        let manager = manager(platform.clone());

        let handle = manager
            .acquire_session(small_request([DeviceKind::Camera, DeviceKind::Screen]))
            .await
            .unwrap();
        let info = &manager.active_sessions()[0];
        assert!(info.composited);
        assert_eq!(info.state, SinkState::Recording);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let stopped = manager.stop_session(handle).await.unwrap();

        assert_eq!(stopped.cleanup.count_of(ResourceKind::FrameBuffer), 1);
        assert_eq!(stopped.cleanup.count_of(ResourceKind::AnimationLoop), 1);
        assert!(stopped.clip.blob.bytes().starts_with(b"YUV4MPEG2 W32 H24"));
        assert_eq!(platform.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_manager_future_releases_resources() {
        let platform = Arc::new(SyntheticPlatform::new(
            SyntheticConfig::default().with_grant_delay(Duration::from_secs(10)),
        ));
        let manager = manager(platform.clone());

        let attempt = tokio::time::timeout(
            Duration::from_secs(15),
            manager.acquire_session(small_request([DeviceKind::Camera, DeviceKind::Microphone])),
        )
        .await;

        assert!(attempt.is_err());
        assert_eq!(platform.live_tracks(), 0);
        assert!(manager.holder_of(DeviceKind::Camera).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_is_signalled() {
        let platform = Arc::new(SyntheticPlatform::new(SyntheticConfig::default()));
        let manager = manager(platform);
        let handle = manager
            .acquire_session(
                small_request([DeviceKind::Microphone]).with_max_duration(Duration::from_secs(3)),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), manager.wait_for_limit(handle))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.elapsed_secs(handle), Some(3));
        let stopped = manager.stop_session(handle).await.unwrap();
        assert!(stopped.clip.blob.bytes().starts_with(b"RIFF"));
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_error_aborts_session() {
        let platform = Arc::new(SyntheticPlatform::new(SyntheticConfig::default()));
        let manager = manager(platform.clone());
        let handle = manager
            .acquire_session(small_request([DeviceKind::Camera]))
            .await
            .unwrap();

        platform
            .last_recorder()
            .unwrap()
            .fail(PlatformError::new("EncodingError", "disk full"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.session_state(handle.id()).is_none());
        assert_eq!(platform.live_tracks(), 0);
        assert!(manager.stop_session(handle).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_everything() {
        let platform = Arc::new(SyntheticPlatform::new(SyntheticConfig::default()));
        let manager = manager(platform.clone());
        manager
            .acquire_session(small_request([DeviceKind::Camera]))
            .await
            .unwrap();
        manager
            .acquire_session(small_request([DeviceKind::Microphone]))
            .await
            .unwrap();
        assert_eq!(manager.active_sessions().len(), 2);

        manager.shutdown();

        assert!(manager.active_sessions().is_empty());
        assert_eq!(platform.live_tracks(), 0);
        assert!(!manager.monitor().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn recorder_failures_are_reaped_after_shutdown() {
        let platform = Arc::new(SyntheticPlatform::new(SyntheticConfig::default()));
        let manager = manager(platform.clone());
        manager
            .acquire_session(small_request([DeviceKind::Camera]))
            .await
            .unwrap();
        manager.shutdown();

        let handle = manager
            .acquire_session(small_request([DeviceKind::Microphone]))
            .await
            .unwrap();
        platform
            .last_recorder()
            .unwrap()
            .fail(PlatformError::new("EncodingError", "disk full"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(manager.session_state(handle.id()).is_none());
        assert_eq!(platform.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stops_release_once() {
        let platform = Arc::new(SyntheticPlatform::new(SyntheticConfig::default()));
        let manager = manager(platform.clone());
        let handle = manager
            .acquire_session(small_request([DeviceKind::Camera]))
            .await
            .unwrap();

        let (first, second) =
            tokio::join!(manager.stop_session(handle), manager.stop_session(handle));

        let (stopped, err) = match (first, second) {
            (Ok(stopped), Err(err)) | (Err(err), Ok(stopped)) => (stopped, err),
            (first, second) => panic!("expected one stop to win: {first:?} / {second:?}"),
        };
        assert_eq!(stopped.cleanup.count_of(ResourceKind::CameraStream), 1);
        assert!(err.to_string().contains("No active session"));
        assert_eq!(platform.live_tracks(), 0);
    }
}
