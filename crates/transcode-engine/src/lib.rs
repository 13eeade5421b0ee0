//! Capsule Transcode Engine
//!
//! Rewrites a captured raw clip into a distributable container at a chosen
//! quality tier, optionally cropped, trimmed or stripped of audio.
//!
//! # Pipeline
//!
//! ```text
//! raw clip ──▶ write input.<ext> ──▶ exec (profile + filters) ──▶ read output.<fmt>
//!                    │                                                 │
//!                    └──────────── delete both virtual files ◀─────────┘
//! ```
//!
//! The codec runtime sits behind [`TranscodeRuntime`]; [`FfmpegRuntime`]
//! drives a native ffmpeg binary with a scratch directory as its virtual
//! filesystem.

pub mod command;
pub mod engine;
pub mod ffmpeg;
pub mod options;
pub mod profile;
pub mod runtime;

pub use command::build_command;
pub use engine::TranscodeEngine;
pub use ffmpeg::{ffmpeg_version, FfmpegRuntime};
pub use options::{
    CropSpec, QualityTier, TargetFormat, TranscodeOptions, TranscodeRequest, TranscodeResult,
    TrimSpec,
};
pub use profile::{encoder_profile, EncoderProfile, EncoderSpeed};
pub use runtime::{ProgressCallback, TranscodeProgress, TranscodeRuntime};
