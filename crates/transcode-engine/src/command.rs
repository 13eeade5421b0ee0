//! Builds the codec command for a request.
//!
//! Argument order: input, video filters (crop then trim), audio trim,
//! video codec, audio codec or `-an`, container flags, output.

use crate::options::{CropSpec, TargetFormat, TranscodeRequest, TrimSpec};
use crate::profile::encoder_profile;

/// Virtual name the input blob is written under.
pub fn input_name(request: &TranscodeRequest) -> String {
    format!("input.{}", request.input().extension())
}

/// Virtual name the runtime writes the result to.
pub fn output_name(format: TargetFormat) -> String {
    format!("output.{}", format.extension())
}

fn seconds(value: f64) -> String {
    let formatted = format!("{value:.3}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn crop_filter(crop: &CropSpec) -> String {
    format!("crop={}:{}:{}:{}", crop.width, crop.height, crop.x, crop.y)
}

fn trim_range(trim: &TrimSpec) -> String {
    match trim.end_secs {
        Some(end) => format!("start={}:end={}", seconds(trim.start_secs), seconds(end)),
        None => format!("start={}", seconds(trim.start_secs)),
    }
}

/// Full argument list for converting `request` from `input` to `output`.
pub fn build_command(request: &TranscodeRequest, input: &str, output: &str) -> Vec<String> {
    let format = request.target_format();
    let profile = encoder_profile(request.quality_tier(), format);
    let mut args = vec!["-i".to_string(), input.to_string()];

    // Audio-only inputs never carry a crop; their trim goes through `-af` alone.
    let has_video = !request.input().is_audio_only();
    let mut video_filters = Vec::new();
    if let Some(crop) = request.crop() {
        video_filters.push(crop_filter(&crop));
    }
    if let (Some(trim), true) = (request.trim(), has_video) {
        video_filters.push(format!("trim={}", trim_range(&trim)));
        video_filters.push("setpts=PTS-STARTPTS".to_string());
    }
    if !video_filters.is_empty() {
        args.push("-vf".to_string());
        args.push(video_filters.join(","));
    }
    if let (Some(trim), true) = (request.trim(), request.include_audio()) {
        args.push("-af".to_string());
        args.push(format!("atrim={},asetpts=PTS-STARTPTS", trim_range(&trim)));
    }

    args.extend(profile.video_args());
    if request.include_audio() {
        args.extend(profile.audio_args());
    } else {
        args.push("-an".to_string());
    }

    if request.optimize_for_playback() && format.supports_faststart() {
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
    }

    args.push(output.to_string());
    args
}
