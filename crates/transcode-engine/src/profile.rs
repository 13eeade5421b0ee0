//! The quality-tier lookup table.

use crate::options::{QualityTier, TargetFormat};

/// Encoder speed control. x264 takes a named preset; libvpx takes a
/// deadline plus a `cpu-used` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderSpeed {
    Preset(&'static str),
    Deadline {
        deadline: &'static str,
        cpu_used: u8,
    },
}

/// Video encoder settings for one `(tier, format)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderProfile {
    pub codec: &'static str,
    pub crf: u8,
    pub speed: EncoderSpeed,
    pub audio_codec: &'static str,
    pub audio_bitrate: &'static str,
}

/// Look up encoder settings. Pure: the same inputs always give the same
/// profile.
pub fn encoder_profile(tier: QualityTier, format: TargetFormat) -> EncoderProfile {
    match format {
        TargetFormat::Mp4 => {
            let (preset, crf) = match tier {
                QualityTier::High => ("slow", 18),
                QualityTier::Medium => ("medium", 23),
                QualityTier::Low => ("fast", 28),
            };
            EncoderProfile {
                codec: "libx264",
                crf,
                speed: EncoderSpeed::Preset(preset),
                audio_codec: "aac",
                audio_bitrate: "128k",
            }
        }
        TargetFormat::Webm => {
            let (crf, cpu_used) = match tier {
                QualityTier::High => (31, 1),
                QualityTier::Medium => (35, 2),
                QualityTier::Low => (41, 4),
            };
            EncoderProfile {
                codec: "libvpx-vp9",
                crf,
                speed: EncoderSpeed::Deadline {
                    deadline: "good",
                    cpu_used,
                },
                audio_codec: "libopus",
                audio_bitrate: "128k",
            }
        }
    }
}

impl EncoderProfile {
    /// Video codec arguments.
    pub fn video_args(&self) -> Vec<String> {
        let mut args = vec!["-c:v".to_string(), self.codec.to_string()];
        match self.speed {
            EncoderSpeed::Preset(preset) => {
                args.extend(["-preset".to_string(), preset.to_string()]);
                args.extend(["-crf".to_string(), self.crf.to_string()]);
            }
            EncoderSpeed::Deadline { deadline, cpu_used } => {
                // Constant-quality mode in libvpx needs a zero target bitrate.
                args.extend(["-crf".to_string(), self.crf.to_string()]);
                args.extend(["-b:v".to_string(), "0".to_string()]);
                args.extend(["-deadline".to_string(), deadline.to_string()]);
                args.extend(["-cpu-used".to_string(), cpu_used.to_string()]);
            }
        }
        args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
        args
    }

    /// Audio codec arguments.
    pub fn audio_args(&self) -> Vec<String> {
        vec![
            "-c:a".to_string(),
            self.audio_codec.to_string(),
            "-b:a".to_string(),
            self.audio_bitrate.to_string(),
        ]
    }
}
