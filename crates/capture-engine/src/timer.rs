//! The per-session recording timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_secs(1);

struct TimerInner {
    stop: AtomicBool,
    elapsed_tx: watch::Sender<u64>,
    limit_tx: watch::Sender<bool>,
}

/// Counts recorded seconds and signals when a maximum duration is reached.
///
/// Ticks once a second on the tokio runtime. Cancelling sets the stop flag
/// and aborts the task in the same call, so no tick lands afterwards.
pub struct RecordingTimer {
    inner: Arc<TimerInner>,
    max_duration: Option<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingTimer {
    /// Start ticking. Must be called inside a tokio runtime.
    pub fn start(max_duration: Option<Duration>) -> Self {
        let (elapsed_tx, _) = watch::channel(0u64);
        let (limit_tx, _) = watch::channel(false);
        let inner = Arc::new(TimerInner {
            stop: AtomicBool::new(false),
            elapsed_tx,
            limit_tx,
        });

        let task_inner = inner.clone();
        let limit_secs = max_duration.map(|d| d.as_secs().max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
            let mut elapsed = 0u64;
            loop {
                ticker.tick().await;
                if task_inner.stop.load(Ordering::SeqCst) {
                    break;
                }
                elapsed += 1;
                task_inner.elapsed_tx.send_replace(elapsed);
                if limit_secs.is_some_and(|limit| elapsed >= limit) {
                    tracing::info!(elapsed_secs = elapsed, "Maximum recording duration reached");
                    task_inner.limit_tx.send_replace(true);
                    break;
                }
            }
        });

        Self {
            inner,
            max_duration,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn elapsed_secs(&self) -> u64 {
        *self.inner.elapsed_tx.borrow()
    }

    /// Watch elapsed seconds.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.elapsed_tx.subscribe()
    }

    pub fn is_limit_reached(&self) -> bool {
        *self.inner.limit_tx.borrow()
    }

    /// Resolves once the maximum duration is reached. Never resolves when
    /// no maximum was set or the timer was cancelled first.
    pub async fn limit_reached(&self) {
        let mut rx = self.inner.limit_tx.subscribe();
        if rx.wait_for(|reached| *reached).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Stop ticking. Idempotent.
    pub fn cancel(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!(elapsed_secs = self.elapsed_secs(), "Recording timer cancelled");
        }
    }
}

impl Drop for RecordingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_whole_seconds() {
        let timer = RecordingTimer::start(None);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(timer.elapsed_secs(), 3);
        assert!(!timer.is_limit_reached());
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn signals_maximum_duration() {
        let timer = RecordingTimer::start(Some(Duration::from_secs(2)));
        tokio::time::timeout(Duration::from_secs(5), timer.limit_reached())
            .await
            .expect("limit should be reached");
        assert!(timer.is_limit_reached());
        assert_eq!(timer.elapsed_secs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_tick_after_cancel() {
        let timer = RecordingTimer::start(None);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(timer.elapsed_secs(), 1);
        assert!(timer.is_cancelled());
    }
}
