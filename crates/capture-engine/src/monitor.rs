//! Session-scoped heap sampling.
//!
//! One [`MonitorService`] is shared by every session in the process. The
//! first session to register spawns the sampler; the last one to leave
//! cancels it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use capsule_common::config::MonitorConfig;
use capsule_common::error::{CapsuleError, CapsuleResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One heap reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
}

impl MemorySample {
    /// `used / limit`, or 0 when the limit is unknown.
    pub fn usage_ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

/// Source of heap readings.
pub trait HeapProbe: Send + Sync {
    fn sample(&self) -> CapsuleResult<MemorySample>;
}

/// Reads this process's resident memory through `sysinfo`.
pub struct SystemHeapProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    limit_bytes: Option<u64>,
}

impl SystemHeapProbe {
    /// `limit_bytes` overrides the system total as the warning baseline.
    pub fn new(limit_bytes: Option<u64>) -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!("Cannot resolve own pid; sampling system memory: {e}"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
            limit_bytes,
        }
    }
}

impl HeapProbe for SystemHeapProbe {
    fn sample(&self) -> CapsuleResult<MemorySample> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let used = match self.pid {
            Some(pid) => {
                system.refresh_process(pid);
                system
                    .process(pid)
                    .map(|process| process.memory())
                    .ok_or_else(|| CapsuleError::platform(format!("Process {pid} not found")))?
            }
            None => system.used_memory(),
        };
        let total = system.total_memory();
        Ok(MemorySample {
            timestamp: Utc::now(),
            used_bytes: used,
            total_bytes: total,
            limit_bytes: self.limit_bytes.unwrap_or(total),
        })
    }
}

pub type MemoryWarningCallback = Arc<dyn Fn(&MemorySample) + Send + Sync>;

#[derive(Default)]
struct SamplerState {
    sessions: HashSet<Uuid>,
    stop: Option<Arc<AtomicBool>>,
    task: Option<JoinHandle<()>>,
}

struct MonitorInner {
    probe: Arc<dyn HeapProbe>,
    interval: Duration,
    warn_ratio: f64,
    state: Mutex<SamplerState>,
    callbacks: Mutex<Vec<MemoryWarningCallback>>,
    latest: Mutex<Option<MemorySample>>,
    ticks: AtomicU64,
}

impl MonitorInner {
    fn sample_once(&self) {
        let sample = match self.probe.sample() {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %e, "Heap sample failed");
                return;
            }
        };
        self.ticks.fetch_add(1, Ordering::Relaxed);
        *self.latest.lock() = Some(sample);

        let ratio = sample.usage_ratio();
        if ratio > self.warn_ratio {
            tracing::warn!(
                used_bytes = sample.used_bytes,
                limit_bytes = sample.limit_bytes,
                ratio,
                "Memory usage above warning threshold"
            );
            let callbacks = self.callbacks.lock().clone();
            for callback in callbacks {
                callback(&sample);
            }
        } else {
            tracing::trace!(used_bytes = sample.used_bytes, ratio, "Heap sample");
        }
    }
}

/// Shared heap sampler bound to the lifetime of active sessions.
#[derive(Clone)]
pub struct MonitorService {
    inner: Arc<MonitorInner>,
}

impl MonitorService {
    pub fn new(probe: Arc<dyn HeapProbe>, config: &MonitorConfig) -> Self {
        Self::with_settings(
            probe,
            Duration::from_millis(config.interval_ms.max(1)),
            config.warn_ratio,
        )
    }

    pub fn with_settings(probe: Arc<dyn HeapProbe>, interval: Duration, warn_ratio: f64) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                interval,
                warn_ratio,
                state: Mutex::new(SamplerState::default()),
                callbacks: Mutex::new(Vec::new()),
                latest: Mutex::new(None),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Monitor backed by [`SystemHeapProbe`].
    pub fn system(config: &MonitorConfig) -> Self {
        Self::new(Arc::new(SystemHeapProbe::new(config.heap_limit_bytes)), config)
    }

    /// Register a session. The first registration starts sampling; must be
    /// called inside a tokio runtime.
    pub fn start(&self, session_id: Uuid) {
        let mut state = self.inner.state.lock();
        if !state.sessions.insert(session_id) {
            return;
        }
        if state.task.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = stop.clone();
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if task_stop.load(Ordering::SeqCst) {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sample_once();
            }
        });
        state.stop = Some(stop);
        state.task = Some(task);
        tracing::debug!(
            session = %session_id,
            interval_ms = interval.as_millis() as u64,
            "Memory monitor started"
        );
    }

    /// Deregister a session. When none remain the sampler is cancelled
    /// before this returns.
    pub fn stop(&self, session_id: Uuid) {
        let mut state = self.inner.state.lock();
        if !state.sessions.remove(&session_id) || !state.sessions.is_empty() {
            return;
        }
        if let Some(stop) = state.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(task) = state.task.take() {
            task.abort();
            tracing::debug!(session = %session_id, "Memory monitor stopped");
        }
    }

    /// Register a callback run with every sample above the threshold.
    pub fn on_memory_warning(&self, callback: impl Fn(&MemorySample) + Send + Sync + 'static) {
        self.inner.callbacks.lock().push(Arc::new(callback));
    }

    /// Take one sample immediately, outside the sampler schedule.
    pub fn sample_now(&self) -> CapsuleResult<MemorySample> {
        self.inner.probe.sample()
    }

    pub fn latest_sample(&self) -> Option<MemorySample> {
        *self.inner.latest.lock()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().task.is_some()
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Samples taken since creation.
    pub fn tick_count(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn warn_ratio(&self) -> f64 {
        self.inner.warn_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FixedProbe {
        used: AtomicU64,
    }

    impl HeapProbe for FixedProbe {
        fn sample(&self) -> CapsuleResult<MemorySample> {
            Ok(MemorySample {
                timestamp: Utc::now(),
                used_bytes: self.used.load(Ordering::SeqCst),
                total_bytes: 1000,
                limit_bytes: 1000,
            })
        }
    }

    fn monitor(used: u64) -> (MonitorService, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe {
            used: AtomicU64::new(used),
        });
        let monitor = MonitorService::with_settings(probe.clone(), Duration::from_secs(5), 0.8);
        (monitor, probe)
    }

    #[test]
    fn usage_ratio_handles_unknown_limit() {
        let sample = MemorySample {
            timestamp: Utc::now(),
            used_bytes: 10,
            total_bytes: 0,
            limit_bytes: 0,
        };
        assert_eq!(sample.usage_ratio(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_share_one_sampler() {
        let (monitor, _) = monitor(100);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        monitor.start(a);
        monitor.start(b);
        monitor.start(b);
        assert_eq!(monitor.active_sessions(), 2);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(monitor.tick_count(), 2);

        monitor.stop(a);
        assert!(monitor.is_running());
        monitor.stop(b);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_after_last_session_leaves() {
        let (monitor, _) = monitor(100);
        let id = Uuid::new_v4();
        monitor.start(id);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        monitor.stop(id);
        let ticks = monitor.tick_count();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(monitor.tick_count(), ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_fires_above_threshold() {
        let (monitor, probe) = monitor(500);
        let warnings = Arc::new(AtomicUsize::new(0));
        let seen = warnings.clone();
        monitor.on_memory_warning(move |sample| {
            assert!(sample.usage_ratio() > 0.8);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let id = Uuid::new_v4();
        monitor.start(id);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(warnings.load(Ordering::SeqCst), 0);

        probe.used.store(900, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.latest_sample().map(|s| s.used_bytes), Some(900));
        monitor.stop(id);
    }

    #[test]
    fn stopping_unknown_session_is_a_no_op() {
        let (monitor, _) = monitor(0);
        monitor.stop(Uuid::new_v4());
        assert!(!monitor.is_running());
    }
}
