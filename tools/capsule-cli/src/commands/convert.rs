//! Convert a recorded clip.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use capsule_common::config::AppConfig;
use capsule_platform_core::Blob;
use capsule_transcode_engine::{
    FfmpegRuntime, TargetFormat, TranscodeEngine, TranscodeOptions, TranscodeRequest,
    TranscodeResult, TrimSpec,
};

use crate::ConvertArgs;

/// Media type for a clip on disk, from its extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "y4m" => "video/x-yuv4mpeg",
        "wav" => "audio/wav",
        "webm" => "video/webm",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

/// Output path next to `input`, never the input itself.
pub fn default_output(input: &Path, format: TargetFormat) -> PathBuf {
    let candidate = input.with_extension(format.extension());
    if candidate == input {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("clip");
        input.with_file_name(format!("{stem}-converted.{}", format.extension()))
    } else {
        candidate
    }
}

pub fn options(format: TargetFormat, args: &ConvertArgs) -> TranscodeOptions {
    TranscodeOptions {
        target_format: format,
        quality_tier: args.quality,
        include_audio: !args.no_audio,
        optimize_for_playback: args.faststart,
        crop: args.crop,
        trim: args.trim_start.map(|start_secs| TrimSpec {
            start_secs,
            end_secs: args.trim_end,
        }),
    }
}

/// Build an engine over the configured ffmpeg with a terminal progress line.
pub fn engine(config: &AppConfig) -> TranscodeEngine {
    let runtime = Arc::new(FfmpegRuntime::from_config(&config.transcode));
    TranscodeEngine::new(runtime).with_progress(|p| {
        if p.complete {
            eprintln!("\r  Encoded {:.1}s          ", p.out_time_secs);
        } else {
            eprint!("\r  Encoded {:.1}s", p.out_time_secs);
        }
    })
}

/// Convert `clip` and write the result to `output`.
pub async fn convert_blob(
    engine: &TranscodeEngine,
    clip: Blob,
    options: TranscodeOptions,
    output: &Path,
) -> anyhow::Result<TranscodeResult> {
    let request = TranscodeRequest::new(clip, options)?;
    println!(
        "  Converting to {} ({} quality)...",
        request.target_format(),
        request.quality_tier()
    );
    let result = engine.convert(request).await?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(output, result.blob.bytes()).await?;
    Ok(result)
}

pub async fn run(
    config: &AppConfig,
    input: PathBuf,
    output: Option<PathBuf>,
    format: TargetFormat,
    args: ConvertArgs,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&input)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", input.display()))?;
    let clip = Blob::new(bytes, mime_for_path(&input));
    let output = output.unwrap_or_else(|| default_output(&input, format));

    println!("Converting: {}", input.display());
    println!("  Input: {} bytes ({})", clip.size(), clip.mime_type());
    println!("  Output: {}", output.display());

    let engine = engine(config);
    let result = convert_blob(&engine, clip, options(format, &args), &output).await?;

    println!(
        "Conversion complete: {} ({} bytes in {:.1}s)",
        output.display(),
        result.size,
        result.elapsed.as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_for_path(Path::new("clip.Y4M")), "video/x-yuv4mpeg");
        assert_eq!(mime_for_path(Path::new("take.webm")), "video/webm");
        assert_eq!(mime_for_path(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn default_output_never_overwrites_input() {
        assert_eq!(
            default_output(Path::new("/tmp/take.y4m"), TargetFormat::Mp4),
            PathBuf::from("/tmp/take.mp4")
        );
        assert_eq!(
            default_output(Path::new("/tmp/take.webm"), TargetFormat::Webm),
            PathBuf::from("/tmp/take-converted.webm")
        );
    }
}
