//! Ordered, contained teardown of a session's resources.

use std::panic::{catch_unwind, AssertUnwindSafe};

use capsule_common::error::CleanupError;
use capsule_common::kind::ResourceKind;

use crate::registry::ResourceRegistry;

/// Outcome of one `release_all` pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Kinds released, in the order their release ran.
    pub released: Vec<ResourceKind>,
    /// Releases that returned an error or panicked.
    pub failures: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn released_count(&self) -> usize {
        self.released.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.failures.is_empty()
    }

    /// How many handles of `kind` were released.
    pub fn count_of(&self, kind: ResourceKind) -> usize {
        self.released.iter().filter(|k| **k == kind).count()
    }
}

/// Releases every handle in a registry.
///
/// Order: recorder, streams, frame buffer, animation loop, interval timer.
/// The recorder goes first so it cannot pull from a stream that is already
/// stopped; the draw loop and timer go last since they only read state.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupCoordinator;

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Release everything `registry` holds. Never fails: errors and panics
    /// from individual releases are logged and collected in the report.
    pub fn release_all(&self, registry: &ResourceRegistry) -> CleanupReport {
        let mut handles = registry.drain();
        if handles.is_empty() {
            return CleanupReport::default();
        }
        handles.sort_by_key(|handle| (handle.kind().release_phase(), handle.kind(), handle.id()));

        let session = registry.session_id();
        let mut report = CleanupReport::default();
        for handle in handles {
            if handle.is_released() {
                continue;
            }
            let kind = handle.kind();
            match catch_unwind(AssertUnwindSafe(|| handle.release())) {
                Ok(Ok(())) => report.released.push(kind),
                Ok(Err(e)) => {
                    tracing::warn!(%session, %kind, error = %e, "Resource release failed");
                    report.released.push(kind);
                    report.failures.push(CleanupError {
                        kind,
                        message: e.to_string(),
                    });
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(%session, %kind, %message, "Resource release panicked");
                    report.released.push(kind);
                    report.failures.push(CleanupError { kind, message });
                }
            }
        }

        tracing::debug!(
            %session,
            released = report.released_count(),
            failures = report.failures.len(),
            "Session resources released"
        );
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic during release".to_string()
    }
}
