//! Media platform backends.

pub mod gst;
pub mod scheduler;
pub mod synthetic;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use capsule_common::config::CaptureDefaults;
use capsule_common::error::{CapsuleError, CapsuleResult};
use capsule_platform_core::MediaPlatform;

pub use gst::GstPlatform;
pub use scheduler::{IntervalFrameScheduler, ManualFrameScheduler};
pub use synthetic::{SyntheticConfig, SyntheticPlatform};

/// Which platform implementation drives capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Real devices through GStreamer.
    #[default]
    Gstreamer,
    /// Generated frames and tones; no hardware needed.
    Synthetic,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Gstreamer => "gstreamer",
            BackendKind::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gstreamer" | "gst" => Ok(BackendKind::Gstreamer),
            "synthetic" | "fake" => Ok(BackendKind::Synthetic),
            other => Err(format!("Unknown backend: {other}")),
        }
    }
}

/// Build the platform for `kind`.
///
/// The GStreamer backend writes its recorder output under `scratch_dir`.
pub fn create_platform(
    kind: BackendKind,
    defaults: &CaptureDefaults,
    scratch_dir: &Path,
) -> CapsuleResult<Arc<dyn MediaPlatform>> {
    let platform: Arc<dyn MediaPlatform> = match kind {
        BackendKind::Gstreamer => Arc::new(
            GstPlatform::new(defaults.fps, scratch_dir.join("recordings"))
                .map_err(|e| CapsuleError::platform(e.to_string()))?,
        ),
        BackendKind::Synthetic => Arc::new(SyntheticPlatform::new(SyntheticConfig {
            frame_rate: defaults.fps,
            ..SyntheticConfig::default()
        })),
    };
    tracing::info!(backend = platform.name(), "Media platform ready");
    Ok(platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("gst".parse::<BackendKind>().unwrap(), BackendKind::Gstreamer);
        assert_eq!("fake".parse::<BackendKind>().unwrap(), BackendKind::Synthetic);
        assert!("directshow".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::default().to_string(), "gstreamer");
    }

    #[test]
    fn synthetic_platform_builds_without_hardware() {
        let platform = create_platform(
            BackendKind::Synthetic,
            &CaptureDefaults::default(),
            Path::new("/nonexistent"),
        )
        .unwrap();
        assert_eq!(platform.name(), "synthetic");
    }
}
