//! User-facing conversion options.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use capsule_common::error::{CapsuleError, CapsuleResult};
use capsule_platform_core::Blob;
use serde::{Deserialize, Serialize};

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    /// H.264 in MP4.
    #[default]
    Mp4,
    /// VP9 in WebM.
    Webm,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 2] = [TargetFormat::Mp4, TargetFormat::Webm];

    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "mp4",
            TargetFormat::Webm => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "video/mp4",
            TargetFormat::Webm => "video/webm",
        }
    }

    /// Whether the container can move its index ahead of the media data.
    pub fn supports_faststart(self) -> bool {
        matches!(self, TargetFormat::Mp4)
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(TargetFormat::Mp4),
            "webm" => Ok(TargetFormat::Webm),
            other => Err(format!("Unknown target format: {other}")),
        }
    }
}

/// Quality preset. Higher tiers encode slower at a lower CRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    #[default]
    Medium,
    Low,
}

impl QualityTier {
    pub const ALL: [QualityTier; 3] = [QualityTier::High, QualityTier::Medium, QualityTier::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(QualityTier::High),
            "medium" => Ok(QualityTier::Medium),
            "low" => Ok(QualityTier::Low),
            other => Err(format!("Unknown quality tier: {other}")),
        }
    }
}

/// Crop rectangle in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropSpec {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FromStr for CropSpec {
    type Err = String;

    /// Parses `WxH+X+Y` (or `WxH`, anchored at the origin).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('+');
        let size = parts.next().unwrap_or_default();
        let (w, h) = size
            .split_once('x')
            .ok_or_else(|| format!("Invalid crop '{s}': expected WxH+X+Y"))?;
        let number = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| format!("Invalid crop '{s}': '{v}' is not a number"))
        };
        let crop = CropSpec {
            width: number(w)?,
            height: number(h)?,
            x: parts.next().map(number).transpose()?.unwrap_or(0),
            y: parts.next().map(number).transpose()?.unwrap_or(0),
        };
        if parts.next().is_some() {
            return Err(format!("Invalid crop '{s}': expected WxH+X+Y"));
        }
        Ok(crop)
    }
}

/// Time range to keep, in seconds from the start of the clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimSpec {
    pub start_secs: f64,
    /// Keep until the end of the clip when unset.
    pub end_secs: Option<f64>,
}

/// Options chosen by the user for one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeOptions {
    pub target_format: TargetFormat,
    pub quality_tier: QualityTier,
    pub include_audio: bool,
    pub optimize_for_playback: bool,
    pub crop: Option<CropSpec>,
    pub trim: Option<TrimSpec>,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            target_format: TargetFormat::default(),
            quality_tier: QualityTier::default(),
            include_audio: true,
            optimize_for_playback: false,
            crop: None,
            trim: None,
        }
    }
}

impl TranscodeOptions {
    fn validate(&self) -> CapsuleResult<()> {
        if let Some(crop) = &self.crop {
            if crop.width == 0 || crop.height == 0 {
                return Err(CapsuleError::config("Crop width and height must be non-zero"));
            }
        }
        if let Some(trim) = &self.trim {
            if !trim.start_secs.is_finite() || trim.start_secs < 0.0 {
                return Err(CapsuleError::config("Trim start must be a non-negative number"));
            }
            if let Some(end) = trim.end_secs {
                if !end.is_finite() || end <= trim.start_secs {
                    return Err(CapsuleError::config("Trim end must be after trim start"));
                }
            }
        }
        Ok(())
    }
}

/// A validated conversion job. Immutable once built.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    input: Blob,
    options: TranscodeOptions,
}

impl TranscodeRequest {
    pub fn new(input: Blob, options: TranscodeOptions) -> CapsuleResult<Self> {
        if input.is_empty() {
            return Err(CapsuleError::config("Cannot convert an empty clip"));
        }
        options.validate()?;
        if input.is_audio_only() {
            if options.crop.is_some() {
                return Err(CapsuleError::unsupported(format!(
                    "Cannot crop an audio-only clip ({})",
                    input.mime_type()
                )));
            }
            if !options.include_audio {
                return Err(CapsuleError::config(
                    "Dropping audio from an audio-only clip leaves nothing to convert",
                ));
            }
        }
        Ok(Self { input, options })
    }

    pub fn input(&self) -> &Blob {
        &self.input
    }

    pub fn options(&self) -> &TranscodeOptions {
        &self.options
    }

    pub fn target_format(&self) -> TargetFormat {
        self.options.target_format
    }

    pub fn quality_tier(&self) -> QualityTier {
        self.options.quality_tier
    }

    pub fn include_audio(&self) -> bool {
        self.options.include_audio
    }

    pub fn optimize_for_playback(&self) -> bool {
        self.options.optimize_for_playback
    }

    pub fn crop(&self) -> Option<CropSpec> {
        self.options.crop
    }

    pub fn trim(&self) -> Option<TrimSpec> {
        self.options.trim
    }
}

/// Output of a finished conversion.
#[derive(Debug, Clone)]
pub struct TranscodeResult {
    pub blob: Blob,
    pub size: usize,
    /// Wall-clock time spent converting, excluding runtime load.
    pub elapsed: Duration,
}
