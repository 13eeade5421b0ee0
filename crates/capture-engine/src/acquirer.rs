//! Device acquisition and permission-failure classification.

use std::future::Future;
use std::sync::Arc;

use capsule_common::error::{CapsuleError, CapsuleResult, PermissionError, PermissionReason};
use capsule_common::kind::DeviceKind;
use capsule_platform_core::{CaptureConstraints, MediaPlatform, MediaStream, PlatformError};

/// Requests capture streams from a [`MediaPlatform`].
#[derive(Clone)]
pub struct CaptureDeviceAcquirer {
    platform: Arc<dyn MediaPlatform>,
}

impl CaptureDeviceAcquirer {
    pub fn new(platform: Arc<dyn MediaPlatform>) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &Arc<dyn MediaPlatform> {
        &self.platform
    }

    /// Request one device. Platform failures come back as
    /// `CapsuleError::Permission` with a classified reason.
    pub async fn acquire(
        &self,
        kind: DeviceKind,
        constraints: &CaptureConstraints,
    ) -> CapsuleResult<Arc<dyn MediaStream>> {
        tracing::debug!(platform = self.platform.name(), %kind, "Requesting capture");
        let stream = self
            .platform
            .request_capture(kind, constraints)
            .await
            .map_err(|e| {
                let err = classify_failure(kind, &e);
                tracing::warn!(
                    %kind,
                    reason = err.reason.as_str(),
                    platform_error = %e,
                    "Capture request refused"
                );
                CapsuleError::Permission(err)
            })?;

        if stream.is_ended() {
            if let Err(e) = stream.stop() {
                tracing::warn!(%kind, stream = stream.id(), error = %e, "Failed to stop ended stream");
            }
            return Err(PermissionError::new(
                kind,
                PermissionReason::Unknown,
                "stream ended before it could be used",
            )
            .into());
        }

        tracing::info!(%kind, stream = stream.id(), "Capture granted");
        Ok(stream)
    }

    /// Like [`acquire`](Self::acquire), but on a permission failure asks
    /// `retry` whether to try once more. There is never more than one
    /// retry; a second failure is returned with `retried` set.
    pub async fn acquire_with_retry<F, Fut>(
        &self,
        kind: DeviceKind,
        constraints: &CaptureConstraints,
        retry: F,
    ) -> CapsuleResult<Arc<dyn MediaStream>>
    where
        F: FnOnce(PermissionError) -> Fut,
        Fut: Future<Output = bool>,
    {
        let first = match self.acquire(kind, constraints).await {
            Ok(stream) => return Ok(stream),
            Err(CapsuleError::Permission(err)) => err,
            Err(other) => return Err(other),
        };

        if !retry(first.clone()).await {
            return Err(first.into());
        }

        tracing::info!(%kind, "Retrying capture request");
        match self.acquire(kind, constraints).await {
            Err(CapsuleError::Permission(mut err)) => {
                err.retried = true;
                Err(err.into())
            }
            other => other,
        }
    }
}

/// Map a raw platform failure onto a [`PermissionReason`].
pub fn classify_failure(kind: DeviceKind, error: &PlatformError) -> PermissionError {
    let message = error.message.to_ascii_lowercase();
    let reason = match error.name.as_str() {
        "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
            PermissionReason::NotAllowed
        }
        "NotSupportedError" | "NotFoundError" | "DevicesNotFoundError"
        | "OverconstrainedError" | "TypeError" => PermissionReason::NotSupported,
        "InvalidStateError" if kind == DeviceKind::Screen => PermissionReason::NotSupported,
        "NetworkError" => PermissionReason::NetworkError,
        "AbortError" if message.contains("network") || message.contains("timeout") => {
            PermissionReason::NetworkError
        }
        _ if message.contains("denied") || message.contains("permission") => {
            PermissionReason::NotAllowed
        }
        _ => PermissionReason::Unknown,
    };
    PermissionError::new(kind, reason, error.to_string())
}
