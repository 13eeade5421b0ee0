//! Error types shared across Capsule crates.

use std::fmt;

use crate::kind::{DeviceKind, ResourceKind};

/// Top-level error type for Capsule operations.
#[derive(Debug, thiserror::Error)]
pub enum CapsuleError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("Resource busy: a {kind} is already held by an active session")]
    ResourceBusy { kind: ResourceKind },

    #[error("Transcode runtime failed to load: {message}")]
    TranscodeLoad { message: String },

    #[error("Transcode failed: {message}")]
    TranscodeExec { message: String },

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("Capture error: {message}")]
    Capture { message: String },

    #[error("Platform error: {message}")]
    Platform { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using CapsuleError.
pub type CapsuleResult<T> = Result<T, CapsuleError>;

impl CapsuleError {
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture {
            message: msg.into(),
        }
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    pub fn transcode_load(msg: impl Into<String>) -> Self {
        Self::TranscodeLoad {
            message: msg.into(),
        }
    }

    pub fn transcode_exec(msg: impl Into<String>) -> Self {
        Self::TranscodeExec {
            message: msg.into(),
        }
    }

    pub fn busy(kind: ResourceKind) -> Self {
        Self::ResourceBusy { kind }
    }

    /// Whether the caller can recover without restarting the process
    /// (retry the permission prompt, stop the other session, retry the load).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Permission(_) | Self::ResourceBusy { .. } | Self::TranscodeLoad { .. }
        )
    }

    /// Stable machine-readable code for the UI layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Permission(_) => "PERMISSION_DENIED",
            Self::ResourceBusy { .. } => "RESOURCE_BUSY",
            Self::TranscodeLoad { .. } => "TRANSCODE_LOAD_ERROR",
            Self::TranscodeExec { .. } => "TRANSCODE_EXEC_ERROR",
            Self::Cleanup(_) => "CLEANUP_ERROR",
            Self::Capture { .. } => "CAPTURE_ERROR",
            Self::Platform { .. } => "PLATFORM_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// Why a capture request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionReason {
    /// The user or the system policy denied access.
    NotAllowed,
    /// No such device, or the platform cannot capture it.
    NotSupported,
    /// The request failed in transit (remote desktop, portal timeout).
    NetworkError,
    Unknown,
}

impl PermissionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionReason::NotAllowed => "not allowed",
            PermissionReason::NotSupported => "not supported",
            PermissionReason::NetworkError => "network error",
            PermissionReason::Unknown => "unknown error",
        }
    }
}

/// A typed capture failure for one device kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionError {
    pub kind: DeviceKind,
    pub reason: PermissionReason,
    /// Platform message, kept for logs.
    pub detail: String,
    /// Set when an injected retry was attempted and also failed.
    pub retried: bool,
}

impl PermissionError {
    pub fn new(kind: DeviceKind, reason: PermissionReason, detail: impl Into<String>) -> Self {
        Self {
            kind,
            reason,
            detail: detail.into(),
            retried: false,
        }
    }

    /// Whether offering a retry makes sense. A second denial, or a device
    /// that does not exist, goes to the help path instead.
    pub fn is_retryable(&self) -> bool {
        !self.retried
            && matches!(
                self.reason,
                PermissionReason::NotAllowed | PermissionReason::NetworkError
            )
    }

    /// Guidance on how to enable access.
    pub fn help(&self) -> String {
        match (self.reason, self.kind) {
            (PermissionReason::NotAllowed, DeviceKind::Screen) => {
                "Screen capture was blocked. Allow screen recording for this application in the system privacy settings (or accept the desktop portal prompt), then try again.".to_string()
            }
            (PermissionReason::NotAllowed, kind) => format!(
                "Access to the {kind} was blocked. Grant {kind} access in the system privacy settings, then try again."
            ),
            (PermissionReason::NotSupported, kind) => format!(
                "No usable {kind} was found. Check that the device is connected and not in use by another application."
            ),
            (PermissionReason::NetworkError, kind) => format!(
                "The {kind} request did not complete. Check the connection to the capture service and retry."
            ),
            (PermissionReason::Unknown, kind) => format!(
                "The {kind} could not be started. Restart the application; if the problem persists, check the logs."
            ),
        }
    }
}

impl fmt::Display for PermissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Permission error for {}: {}",
            self.kind,
            self.reason.as_str()
        )?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for PermissionError {}

/// Failure releasing a single handle. Logged and reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to release {kind}: {message}")]
pub struct CleanupError {
    pub kind: ResourceKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_error_display_names_kind_and_reason() {
        let err = PermissionError::new(DeviceKind::Camera, PermissionReason::NotAllowed, "");
        assert_eq!(err.to_string(), "Permission error for camera: not allowed");
        assert!(err.is_retryable());
    }

    #[test]
    fn retried_permission_error_goes_to_help_path() {
        let mut err =
            PermissionError::new(DeviceKind::Microphone, PermissionReason::NotAllowed, "denied");
        err.retried = true;
        assert!(!err.is_retryable());
        assert!(err.help().contains("microphone"));
    }

    #[test]
    fn busy_and_permission_errors_are_recoverable() {
        assert!(CapsuleError::busy(ResourceKind::CameraStream).is_recoverable());
        assert!(!CapsuleError::transcode_exec("boom").is_recoverable());
        assert_eq!(
            CapsuleError::transcode_load("missing").code(),
            "TRANSCODE_LOAD_ERROR"
        );
    }
}
