//! Frame schedulers for backends without a display refresh callback.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use capsule_platform_core::{FrameCallback, FrameRequestId, FrameScheduler, FrameTick};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct IntervalInner {
    interval: Duration,
    epoch: Instant,
    next_id: AtomicU64,
    next_index: AtomicU64,
    pending: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl Drop for IntervalInner {
    fn drop(&mut self) {
        for (_, task) in self.pending.get_mut().drain() {
            task.abort();
        }
    }
}

/// Fires each requested frame after a fixed interval on the tokio runtime.
///
/// Must be used from inside a runtime; requests made elsewhere are logged
/// and never fire.
#[derive(Clone)]
pub struct IntervalFrameScheduler {
    inner: Arc<IntervalInner>,
}

impl IntervalFrameScheduler {
    pub fn new(fps: u32) -> Self {
        Self::with_interval(Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1))))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            inner: Arc::new(IntervalInner {
                interval,
                epoch: Instant::now(),
                next_id: AtomicU64::new(1),
                next_index: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl FrameScheduler for IntervalFrameScheduler {
    fn request_frame(&self, callback: FrameCallback) -> FrameRequestId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Frame requested outside a tokio runtime; it will not fire");
            return FrameRequestId(id);
        };

        let mut pending = self.inner.pending.lock();
        let weak: Weak<IntervalInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        let task = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.pending.lock().remove(&id).is_none() {
                return;
            }
            let tick = FrameTick {
                index: inner.next_index.fetch_add(1, Ordering::Relaxed),
                timestamp_ns: inner.epoch.elapsed().as_nanos() as u64,
            };
            drop(inner);
            callback(tick);
        });
        pending.insert(id, task);
        FrameRequestId(id)
    }

    fn cancel_frame(&self, id: FrameRequestId) {
        if let Some(task) = self.inner.pending.lock().remove(&id.0) {
            task.abort();
        }
    }
}

/// A scheduler that only fires when told to. Used to step draw loops
/// deterministically.
#[derive(Default)]
pub struct ManualFrameScheduler {
    pending: Mutex<BTreeMap<u64, FrameCallback>>,
    next_id: AtomicU64,
    fired: AtomicU64,
}

impl ManualFrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the oldest pending callback. Returns `false` when nothing is
    /// pending.
    pub fn fire_next_frame(&self) -> bool {
        let next = self.pending.lock().pop_first();
        match next {
            Some((_, callback)) => {
                let index = self.fired.fetch_add(1, Ordering::Relaxed);
                callback(FrameTick {
                    index,
                    timestamp_ns: index * 16_666_667,
                });
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

impl FrameScheduler for ManualFrameScheduler {
    fn request_frame(&self, callback: FrameCallback) -> FrameRequestId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, callback);
        FrameRequestId(id)
    }

    fn cancel_frame(&self, id: FrameRequestId) {
        self.pending.lock().remove(&id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn interval_scheduler_fires_after_interval() {
        let scheduler = IntervalFrameScheduler::new(10);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scheduler.request_frame(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_never_fires() {
        let scheduler = IntervalFrameScheduler::new(30);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = scheduler.request_frame(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        scheduler.cancel_frame(id);
        scheduler.cancel_frame(id);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn manual_scheduler_fires_in_request_order() {
        let scheduler = ManualFrameScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            scheduler.request_frame(Box::new(move |_| order.lock().push(n)));
        }
        while scheduler.fire_next_frame() {}
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(scheduler.fired_count(), 3);
    }
}
