//! Record a clip.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use capsule_capture_engine::{
    create_platform, BackendKind, MonitorService, SessionHandle, SessionManager, SessionRequest,
};
use capsule_common::config::{AppConfig, CaptureDefaults};
use capsule_common::error::{CapsuleError, PermissionError};
use capsule_common::kind::DeviceKind;
use capsule_transcode_engine::TargetFormat;

use crate::commands::convert;
use crate::ConvertArgs;

pub struct RecordArgs {
    pub camera: bool,
    pub screen: bool,
    pub mic: bool,
    pub backend: BackendKind,
    pub duration: Option<u64>,
    pub output: Option<PathBuf>,
    pub capture: CaptureDefaults,
    pub convert: Option<(TargetFormat, ConvertArgs)>,
}

fn requested_kinds(args: &RecordArgs) -> Vec<DeviceKind> {
    let mut kinds = Vec::new();
    if args.camera {
        kinds.push(DeviceKind::Camera);
    }
    if args.screen {
        kinds.push(DeviceKind::Screen);
    }
    if args.mic {
        kinds.push(DeviceKind::Microphone);
    }
    kinds
}

/// Ask on the terminal whether to retry after a denial.
async fn confirm_retry(err: &PermissionError) -> bool {
    println!("{err}");
    println!("{}", err.help());
    print!("Retry now? [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await;
    matches!(answer, Ok(Ok(line)) if line.trim().eq_ignore_ascii_case("y"))
}

/// Acquire a session, offering one retry on a retryable denial.
async fn acquire(manager: &SessionManager, request: SessionRequest) -> anyhow::Result<SessionHandle> {
    let err = match manager.acquire_session(request.clone()).await {
        Ok(handle) => return Ok(handle),
        Err(CapsuleError::Permission(err)) => err,
        Err(CapsuleError::ResourceBusy { kind }) => {
            anyhow::bail!("The {kind} is in use by another session; stop it first")
        }
        Err(e) => return Err(e.into()),
    };

    if !err.is_retryable() {
        println!("{}", err.help());
        return Err(err.into());
    }
    if !confirm_retry(&err).await {
        return Err(err.into());
    }

    match manager.acquire_session(request).await {
        Ok(handle) => Ok(handle),
        Err(CapsuleError::Permission(mut err)) => {
            err.retried = true;
            println!("{}", err.help());
            Err(err.into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn run(config: &AppConfig, args: RecordArgs) -> anyhow::Result<()> {
    let kinds = requested_kinds(&args);
    if kinds.is_empty() {
        anyhow::bail!("Nothing to record: pass --camera and/or --screen, or keep the microphone");
    }

    println!("Starting recording session");
    println!("  Backend: {}", args.backend);
    println!(
        "  Devices: {}",
        kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
    );
    println!(
        "  Video: {}x{} @ {} fps",
        args.capture.width, args.capture.height, args.capture.fps
    );
    if let Some(secs) = args.duration {
        println!("  Max duration: {secs}s");
    }
    println!();

    let platform = create_platform(args.backend, &args.capture, &config.transcode.scratch_dir)?;
    let monitor = MonitorService::system(&config.monitor);
    let manager = SessionManager::new(platform, monitor, args.capture.clone());
    manager.on_memory_warning(|sample| {
        eprintln!(
            "Warning: memory use at {:.0}% of limit ({} MiB)",
            sample.usage_ratio() * 100.0,
            sample.used_bytes / (1024 * 1024)
        );
    });

    let mut request = SessionRequest::from_defaults(kinds, &args.capture);
    if let Some(secs) = args.duration {
        request = request.with_max_duration(Duration::from_secs(secs));
    }

    let handle = acquire(&manager, request).await?;
    println!("Recording. Press Ctrl+C to stop...");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C; stopping now");
            }
        }
        limit = manager.wait_for_limit(handle) => {
            if limit.is_ok() {
                println!("Maximum duration reached.");
            }
        }
    }

    println!();
    let stopped = match manager.stop_session(handle).await {
        Ok(stopped) => stopped,
        Err(e) => {
            manager.shutdown();
            return Err(e.into());
        }
    };
    for failure in &stopped.cleanup.failures {
        eprintln!("Warning: {failure}");
    }

    let clip = stopped.clip;
    let output = args.output.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "capsule-{}.{}",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            clip.blob.extension()
        ))
    });
    tokio::fs::write(&output, clip.blob.bytes()).await?;
    println!(
        "Recording saved to: {} ({:.1}s, {} bytes)",
        output.display(),
        clip.duration.as_secs_f64(),
        clip.blob.size()
    );

    if let Some((format, convert_args)) = &args.convert {
        let target = convert::default_output(&output, *format);
        let engine = convert::engine(config);
        let result = convert::convert_blob(
            &engine,
            clip.blob,
            convert::options(*format, convert_args),
            &target,
        )
        .await?;
        println!(
            "Converted to: {} ({} bytes)",
            target.display(),
            result.size
        );
    }

    Ok(())
}
