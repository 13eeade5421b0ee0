use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capsule_capture_engine::backend::{ManualFrameScheduler, SyntheticConfig, SyntheticPlatform};
use capsule_capture_engine::monitor::HeapProbe;
use capsule_capture_engine::{
    CleanupCoordinator, FrameCompositor, MemorySample, MonitorService, PixelBuffer,
    ResourceHandle, ResourceRegistry, SessionManager, SessionRequest,
};
use capsule_common::config::CaptureDefaults;
use capsule_common::error::{CapsuleError, CapsuleResult, PermissionReason};
use capsule_common::kind::{DeviceKind, ResourceKind};
use capsule_platform_core::{
    CaptureConstraints, Frame, FrameSource, MediaRecorder, MediaStream, PlatformError,
};
use uuid::Uuid;

struct IdleProbe;

impl HeapProbe for IdleProbe {
    fn sample(&self) -> CapsuleResult<MemorySample> {
        Ok(MemorySample {
            timestamp: chrono::Utc::now(),
            used_bytes: 10,
            total_bytes: 1000,
            limit_bytes: 1000,
        })
    }
}

fn manager_for(platform: Arc<SyntheticPlatform>) -> SessionManager {
    let monitor = MonitorService::with_settings(Arc::new(IdleProbe), Duration::from_secs(1), 0.8);
    SessionManager::new(platform, monitor, CaptureDefaults::default())
}

fn setup(config: SyntheticConfig) -> (SessionManager, Arc<SyntheticPlatform>) {
    let platform = Arc::new(SyntheticPlatform::new(config));
    (manager_for(platform.clone()), platform)
}

/// Compositing is stepped by hand through the returned scheduler.
fn setup_stepped() -> (SessionManager, Arc<SyntheticPlatform>, Arc<ManualFrameScheduler>) {
    let scheduler = Arc::new(ManualFrameScheduler::new());
    let platform = Arc::new(SyntheticPlatform::with_scheduler(
        SyntheticConfig::default(),
        scheduler.clone(),
    ));
    (manager_for(platform.clone()), platform, scheduler)
}

fn request(kinds: impl IntoIterator<Item = DeviceKind>) -> SessionRequest {
    SessionRequest::new(kinds).with_constraints(CaptureConstraints {
        width: 16,
        height: 16,
        fps: 5,
        ..CaptureConstraints::default()
    })
}

#[tokio::test(start_paused = true)]
async fn camera_and_microphone_record_then_release_everything() {
    let (manager, platform) = setup(SyntheticConfig::default());

    let handle = manager
        .acquire_session(request([DeviceKind::Camera, DeviceKind::Microphone]))
        .await
        .unwrap();
    let recorder = platform.last_recorder().unwrap();
    assert_eq!(recorder.handlers().count(), 4);
    assert_eq!(platform.live_tracks(), 2);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(manager.elapsed_secs(handle), Some(2));

    let stopped = manager.stop_session(handle).await.unwrap();

    assert_eq!(
        stopped.cleanup.released,
        vec![
            ResourceKind::Recorder,
            ResourceKind::CameraStream,
            ResourceKind::MicrophoneStream,
            ResourceKind::IntervalTimer,
        ]
    );
    assert!(stopped.cleanup.is_clean());
    assert_eq!(recorder.handlers().count(), 0);
    assert_eq!(platform.live_tracks(), 0);
    assert_eq!(stopped.clip.blob.mime_type(), "video/x-yuv4mpeg");
    assert!(stopped.clip.blob.bytes().starts_with(b"YUV4MPEG2 W16 H16"));
    assert!(manager.holder_of(DeviceKind::Camera).is_none());
    assert!(!manager.monitor().is_running());
}

#[tokio::test(start_paused = true)]
async fn denied_camera_registers_nothing() {
    let (manager, platform) = setup(
        SyntheticConfig::default()
            .deny(DeviceKind::Camera, PlatformError::not_allowed("Permission denied")),
    );

    let err = manager
        .acquire_session(request([DeviceKind::Camera]))
        .await
        .unwrap_err();

    let err = match err {
        CapsuleError::Permission(err) => err,
        other => panic!("expected a permission error, got {other}"),
    };
    assert_eq!(err.kind, DeviceKind::Camera);
    assert_eq!(err.reason, PermissionReason::NotAllowed);
    assert!(!err.retried);
    assert_eq!(platform.recorder_count(), 0);
    assert_eq!(platform.live_tracks(), 0);
    assert!(manager.active_sessions().is_empty());
    assert!(manager.holder_of(DeviceKind::Camera).is_none());
}

#[tokio::test(start_paused = true)]
async fn overlapping_request_for_held_device_is_busy() {
    let (manager, platform) =
        setup(SyntheticConfig::default().with_grant_delay(Duration::from_millis(500)));

    let (first, second) = tokio::join!(
        manager.acquire_session(request([DeviceKind::Camera])),
        manager.acquire_session(request([DeviceKind::Camera, DeviceKind::Microphone])),
    );

    let first = first.unwrap();
    assert!(matches!(
        second,
        Err(CapsuleError::ResourceBusy {
            kind: ResourceKind::CameraStream
        })
    ));
    assert_eq!(manager.holder_of(DeviceKind::Camera), Some(first.id()));
    assert!(manager.holder_of(DeviceKind::Microphone).is_none());
    assert_eq!(platform.request_log(), vec![DeviceKind::Camera]);

    manager.stop_session(first).await.unwrap();
    assert!(manager.holder_of(DeviceKind::Camera).is_none());
}

#[tokio::test(start_paused = true)]
async fn retry_after_user_grants_access() {
    let (manager, platform) = setup(
        SyntheticConfig::default()
            .deny(DeviceKind::Microphone, PlatformError::not_allowed("Permission denied")),
    );
    let prompts = AtomicUsize::new(0);

    let stream = manager
        .acquirer()
        .acquire_with_retry(
            DeviceKind::Microphone,
            &CaptureConstraints::default(),
            |err| {
                prompts.fetch_add(1, Ordering::SeqCst);
                platform.allow(DeviceKind::Microphone);
                async move { err.is_retryable() }
            },
        )
        .await
        .unwrap();

    assert_eq!(prompts.load(Ordering::SeqCst), 1);
    assert_eq!(stream.device(), Some(DeviceKind::Microphone));
    stream.stop().unwrap();
    assert_eq!(platform.live_tracks(), 0);
}

#[tokio::test(start_paused = true)]
async fn second_denial_is_marked_retried() {
    let (manager, _platform) = setup(
        SyntheticConfig::default()
            .deny(DeviceKind::Screen, PlatformError::not_allowed("Permission denied")),
    );

    let err = manager
        .acquirer()
        .acquire_with_retry(DeviceKind::Screen, &CaptureConstraints::default(), |_| async {
            true
        })
        .await
        .err().unwrap();

    let err = match err {
        CapsuleError::Permission(err) => err,
        other => panic!("expected a permission error, got {other}"),
    };
    assert!(err.retried);
    assert!(!err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn every_device_kind_releases_its_tracks() {
    for kind in DeviceKind::ALL {
        let (manager, platform) = setup(SyntheticConfig::default());
        let handle = manager.acquire_session(request([kind])).await.unwrap();
        assert_eq!(platform.live_tracks(), 1);

        let report = manager.abort_session(handle);
        assert_eq!(report.count_of(kind.resource_kind()), 1);
        assert_eq!(platform.live_tracks(), 0, "{kind} left a live track");
        assert!(manager.abort_session(handle).is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn monitor_stops_within_one_tick_of_last_session() {
    let (manager, _platform) = setup(SyntheticConfig::default());
    let handle = manager
        .acquire_session(request([DeviceKind::Microphone]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(manager.monitor().tick_count(), 3);

    manager.stop_session(handle).await.unwrap();
    let ticks = manager.monitor().tick_count();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(manager.monitor().tick_count() <= ticks + 1);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(manager.monitor().tick_count() <= ticks + 1);
    assert!(!manager.monitor().is_running());
}

#[test]
fn release_all_is_ordered_and_idempotent() {
    let registry = ResourceRegistry::new(Uuid::new_v4());
    let releases = Arc::new(AtomicUsize::new(0));
    for kind in ResourceKind::ALL.iter().rev() {
        let releases = releases.clone();
        registry
            .register(ResourceHandle::new(*kind, kind.as_str(), move || {
                releases.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }

    let coordinator = CleanupCoordinator::new();
    let report = coordinator.release_all(&registry);
    let phases: Vec<u8> = report.released.iter().map(|k| k.release_phase()).collect();
    let mut sorted = phases.clone();
    sorted.sort_unstable();
    assert_eq!(phases, sorted);
    assert_eq!(report.released_count(), ResourceKind::ALL.len());

    assert!(coordinator.release_all(&registry).is_empty());
    assert_eq!(releases.load(Ordering::SeqCst), ResourceKind::ALL.len());
    assert_eq!(registry.live_count(), 0);
}

struct Solid(Frame);

impl FrameSource for Solid {
    fn current_frame(&self) -> Option<Frame> {
        Some(self.0.clone())
    }
}

#[test]
fn compositor_draws_nothing_after_stop() {
    let scheduler = Arc::new(ManualFrameScheduler::new());
    let buffer = Arc::new(PixelBuffer::new(8, 8));
    let sources: Vec<Arc<dyn FrameSource>> = vec![
        Arc::new(Solid(Frame::solid(8, 8, [255, 0, 0, 255]))),
        Arc::new(Solid(Frame::solid(8, 8, [0, 0, 255, 255]))),
    ];
    let compositor = FrameCompositor::start(sources, buffer.clone(), scheduler.clone());

    assert!(scheduler.fire_next_frame());
    assert!(scheduler.fire_next_frame());
    assert_eq!(compositor.frames_drawn(), 2);

    compositor.stop();
    assert_eq!(scheduler.pending_count(), 0);
    assert!(!scheduler.fire_next_frame());
    assert_eq!(compositor.frames_drawn(), 2);
}

#[tokio::test(start_paused = true)]
async fn composited_session_draws_nothing_after_stop() {
    let (manager, platform, scheduler) = setup_stepped();
    let handle = manager
        .acquire_session(request([DeviceKind::Camera, DeviceKind::Screen]))
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(scheduler.fire_next_frame());
    }
    let info = &manager.active_sessions()[0];
    assert!(info.composited);
    assert_eq!(info.frames_drawn, 3);

    let stopped = manager.stop_session(handle).await.unwrap();
    assert_eq!(stopped.frames_drawn, 3);
    assert_eq!(stopped.cleanup.count_of(ResourceKind::AnimationLoop), 1);

    let fired = scheduler.fired_count();
    assert_eq!(scheduler.pending_count(), 0);
    assert!(!scheduler.fire_next_frame());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!scheduler.fire_next_frame());
    assert_eq!(scheduler.fired_count(), fired);
    assert_eq!(platform.live_tracks(), 0);
}

#[tokio::test(start_paused = true)]
async fn composited_session_draws_nothing_after_abort() {
    let (manager, platform, scheduler) = setup_stepped();
    let handle = manager
        .acquire_session(request([DeviceKind::Camera, DeviceKind::Screen]))
        .await
        .unwrap();
    assert!(scheduler.fire_next_frame());
    assert_eq!(manager.active_sessions()[0].frames_drawn, 1);

    let report = manager.abort_session(handle);
    assert_eq!(report.count_of(ResourceKind::AnimationLoop), 1);

    let fired = scheduler.fired_count();
    assert_eq!(scheduler.pending_count(), 0);
    assert!(!scheduler.fire_next_frame());
    assert_eq!(scheduler.fired_count(), fired);
    assert_eq!(platform.live_tracks(), 0);
}
