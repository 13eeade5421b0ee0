//! Tracking of native resources owned by a capture session.
//!
//! Every stream, recorder, buffer, draw loop and timer a session acquires
//! is wrapped in a [`ResourceHandle`] carrying its release function and
//! registered with the session's [`ResourceRegistry`]. The registry holds
//! at most one live handle per [`ResourceKind`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use capsule_common::error::{CapsuleError, CapsuleResult};
use capsule_common::kind::ResourceKind;
use parking_lot::Mutex;
use uuid::Uuid;

type ReleaseFn = Box<dyn FnOnce() -> CapsuleResult<()> + Send>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A tracked reference to one acquired native resource.
pub struct ResourceHandle {
    id: u64,
    kind: ResourceKind,
    label: String,
    release: Mutex<Option<ReleaseFn>>,
    released: AtomicBool,
}

impl ResourceHandle {
    /// Wrap a resource with the function that releases it.
    pub fn new(
        kind: ResourceKind,
        label: impl Into<String>,
        release: impl FnOnce() -> CapsuleResult<()> + Send + 'static,
    ) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            label: label.into(),
            release: Mutex::new(Some(Box::new(release))),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Run the release function. The handle counts as released even when
    /// the function fails; later calls are no-ops.
    pub fn release(&self) -> CapsuleResult<()> {
        let release = self.release.lock().take();
        match release {
            Some(release) => {
                self.released.store(true, Ordering::SeqCst);
                tracing::debug!(kind = %self.kind, label = %self.label, "Releasing resource");
                release()
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("released", &self.is_released())
            .finish()
    }
}

/// The set of handles one session owns.
pub struct ResourceRegistry {
    session_id: Uuid,
    handles: Mutex<Vec<Arc<ResourceHandle>>>,
    registered_total: AtomicU64,
}

impl ResourceRegistry {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            handles: Mutex::new(Vec::new()),
            registered_total: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Record a handle for later release.
    ///
    /// A handle whose kind is already live is rejected with `ResourceBusy`
    /// and released on the spot; the live handle is left untouched.
    pub fn register(&self, handle: ResourceHandle) -> CapsuleResult<Arc<ResourceHandle>> {
        let mut handles = self.handles.lock();
        if handles
            .iter()
            .any(|existing| existing.kind() == handle.kind() && !existing.is_released())
        {
            drop(handles);
            let kind = handle.kind();
            tracing::warn!(
                session = %self.session_id,
                %kind,
                "Rejected duplicate resource; releasing the new handle"
            );
            if let Err(e) = handle.release() {
                tracing::warn!(session = %self.session_id, %kind, error = %e, "Failed to release rejected handle");
            }
            return Err(CapsuleError::busy(kind));
        }

        let handle = Arc::new(handle);
        handles.push(handle.clone());
        self.registered_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            session = %self.session_id,
            kind = %handle.kind(),
            label = %handle.label(),
            "Registered resource"
        );
        Ok(handle)
    }

    /// Whether a live handle of `kind` is registered.
    pub fn is_held(&self, kind: ResourceKind) -> bool {
        self.handles
            .lock()
            .iter()
            .any(|handle| handle.kind() == kind && !handle.is_released())
    }

    /// Kinds of every live handle, in registration order.
    pub fn live_kinds(&self) -> Vec<ResourceKind> {
        self.handles
            .lock()
            .iter()
            .filter(|handle| !handle.is_released())
            .map(|handle| handle.kind())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|handle| !handle.is_released())
            .count()
    }

    /// Number of handles ever accepted by this registry.
    pub fn registered_total(&self) -> u64 {
        self.registered_total.load(Ordering::Relaxed)
    }

    /// Remove every handle. Each handle leaves the registry exactly once,
    /// so a second drain returns nothing.
    pub(crate) fn drain(&self) -> Vec<Arc<ResourceHandle>> {
        std::mem::take(&mut *self.handles.lock())
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("session_id", &self.session_id)
            .field("live", &self.live_kinds())
            .finish()
    }
}
