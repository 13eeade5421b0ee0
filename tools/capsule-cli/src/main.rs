//! Capsule CLI: record clips, convert them, and check the host.
//!
//! Usage:
//!   capsule record [OPTIONS]           Record from camera, microphone and/or screen
//!   capsule convert <INPUT> [OPTIONS]  Convert a raw clip to mp4 or webm
//!   capsule check                      Check capture and codec capabilities

use std::path::PathBuf;

use capsule_capture_engine::BackendKind;
use capsule_common::config::AppConfig;
use capsule_transcode_engine::{CropSpec, QualityTier, TargetFormat};
use clap::{Args, Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "capsule",
    about = "Capture sessions with guaranteed teardown, and quality-tier transcoding",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/capsule/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Conversion options shared by `record --convert` and `convert`.
#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Quality tier: high, medium or low
    #[arg(long, default_value = "medium")]
    quality: QualityTier,

    /// Drop the audio track
    #[arg(long)]
    no_audio: bool,

    /// Move the mp4 index to the front for progressive playback
    #[arg(long)]
    faststart: bool,

    /// Crop rectangle as WxH+X+Y
    #[arg(long)]
    crop: Option<CropSpec>,

    /// Trim start in seconds
    #[arg(long)]
    trim_start: Option<f64>,

    /// Trim end in seconds
    #[arg(long, requires = "trim_start")]
    trim_end: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a clip
    Record {
        /// Capture the camera
        #[arg(long)]
        camera: bool,

        /// Capture the screen
        #[arg(long)]
        screen: bool,

        /// Do not capture the microphone
        #[arg(long)]
        no_mic: bool,

        /// Capture backend: gstreamer or synthetic
        #[arg(long, default_value = "gstreamer")]
        backend: BackendKind,

        /// Shorthand for --backend synthetic
        #[arg(long, conflicts_with = "backend")]
        synthetic: bool,

        /// Stop automatically after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Output file (extension follows the recorded format)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Capture width (overrides config)
        #[arg(long)]
        width: Option<u32>,

        /// Capture height (overrides config)
        #[arg(long)]
        height: Option<u32>,

        /// Target FPS (overrides config)
        #[arg(long)]
        fps: Option<u32>,

        /// Convert the recording to this format after stopping
        #[arg(long)]
        convert: Option<TargetFormat>,

        #[command(flatten)]
        convert_args: ConvertArgs,
    },

    /// Convert a recorded clip
    Convert {
        /// Input clip
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target format: mp4 or webm
        #[arg(short, long, default_value = "mp4")]
        format: TargetFormat,

        #[command(flatten)]
        convert_args: ConvertArgs,
    },

    /// Check capture and codec capabilities
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    logging.json |= cli.json_logs;
    capsule_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Record {
            camera,
            screen,
            no_mic,
            backend,
            synthetic,
            duration,
            output,
            width,
            height,
            fps,
            convert,
            convert_args,
        } => {
            let mut capture = config.capture.clone();
            capture.width = width.unwrap_or(capture.width);
            capture.height = height.unwrap_or(capture.height);
            capture.fps = fps.unwrap_or(capture.fps);

            commands::record::run(
                &config,
                commands::record::RecordArgs {
                    camera,
                    screen,
                    mic: !no_mic,
                    backend: if synthetic {
                        BackendKind::Synthetic
                    } else {
                        backend
                    },
                    duration,
                    output,
                    capture,
                    convert: convert.map(|format| (format, convert_args)),
                },
            )
            .await
        }
        Commands::Convert {
            input,
            output,
            format,
            convert_args,
        } => commands::convert::run(&config, input, output, format, convert_args).await,
        Commands::Check { json } => commands::check::run(&config, json).await,
    }
}
