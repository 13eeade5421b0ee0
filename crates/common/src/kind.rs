//! Vocabulary for capture devices and the native resources a session owns.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A capture device the platform can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Camera,
    Microphone,
    Screen,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Camera, DeviceKind::Microphone, DeviceKind::Screen];

    /// Whether the device produces video frames.
    pub fn is_video(self) -> bool {
        matches!(self, DeviceKind::Camera | DeviceKind::Screen)
    }

    /// The registry kind used for a stream of this device.
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            DeviceKind::Camera => ResourceKind::CameraStream,
            DeviceKind::Microphone => ResourceKind::MicrophoneStream,
            DeviceKind::Screen => ResourceKind::ScreenStream,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Microphone => "microphone",
            DeviceKind::Screen => "screen",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "camera" | "webcam" => Ok(DeviceKind::Camera),
            "microphone" | "mic" => Ok(DeviceKind::Microphone),
            "screen" | "display" => Ok(DeviceKind::Screen),
            other => Err(format!("Unknown device kind: {other}")),
        }
    }
}

/// Kind of a tracked native resource.
///
/// The declaration order is the release order used during teardown:
/// sinks first, then their sources, then the buffers and schedulers
/// that fed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Recorder,
    CameraStream,
    MicrophoneStream,
    ScreenStream,
    FrameBuffer,
    AnimationLoop,
    IntervalTimer,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Recorder,
        ResourceKind::CameraStream,
        ResourceKind::MicrophoneStream,
        ResourceKind::ScreenStream,
        ResourceKind::FrameBuffer,
        ResourceKind::AnimationLoop,
        ResourceKind::IntervalTimer,
    ];

    /// Teardown phase. Lower phases are released first; the three stream
    /// kinds share a phase.
    pub fn release_phase(self) -> u8 {
        match self {
            ResourceKind::Recorder => 0,
            ResourceKind::CameraStream
            | ResourceKind::MicrophoneStream
            | ResourceKind::ScreenStream => 1,
            ResourceKind::FrameBuffer => 2,
            ResourceKind::AnimationLoop => 3,
            ResourceKind::IntervalTimer => 4,
        }
    }

    pub fn is_stream(self) -> bool {
        self.release_phase() == 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Recorder => "recorder",
            ResourceKind::CameraStream => "camera-stream",
            ResourceKind::MicrophoneStream => "microphone-stream",
            ResourceKind::ScreenStream => "screen-stream",
            ResourceKind::FrameBuffer => "frame-buffer",
            ResourceKind::AnimationLoop => "animation-loop",
            ResourceKind::IntervalTimer => "interval-timer",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_phases_put_sinks_before_sources() {
        assert!(ResourceKind::Recorder.release_phase() < ResourceKind::CameraStream.release_phase());
        assert!(
            ResourceKind::ScreenStream.release_phase() < ResourceKind::FrameBuffer.release_phase()
        );
        assert!(
            ResourceKind::AnimationLoop.release_phase()
                < ResourceKind::IntervalTimer.release_phase()
        );
    }

    #[test]
    fn device_kinds_map_to_stream_resources() {
        for kind in DeviceKind::ALL {
            assert!(kind.resource_kind().is_stream());
        }
        assert!(DeviceKind::Screen.is_video());
        assert!(!DeviceKind::Microphone.is_video());
    }

    #[test]
    fn device_kind_parses_aliases() {
        assert_eq!("mic".parse::<DeviceKind>(), Ok(DeviceKind::Microphone));
        assert_eq!("webcam".parse::<DeviceKind>(), Ok(DeviceKind::Camera));
        assert!("printer".parse::<DeviceKind>().is_err());
    }
}
