//! Check capture and codec capabilities.

use capsule_capture_engine::backend::gst::{gstreamer_version, has_element, REQUIRED_ELEMENTS};
use capsule_capture_engine::{HeapProbe, MemorySample, SystemHeapProbe};
use capsule_common::config::{config_file_path, AppConfig};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ElementStatus {
    name: &'static str,
    plugins: &'static str,
    available: bool,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    gstreamer: Option<String>,
    elements: Vec<ElementStatus>,
    ffmpeg: Option<String>,
    ffmpeg_error: Option<String>,
    memory: Option<MemorySample>,
    config_path: String,
    config_exists: bool,
}

impl CheckReport {
    fn capture_ready(&self) -> bool {
        self.gstreamer.is_some() && self.elements.iter().all(|e| e.available)
    }

    fn transcode_ready(&self) -> bool {
        self.ffmpeg.is_some()
    }
}

async fn collect(config: &AppConfig) -> CheckReport {
    let gstreamer = gstreamer_version();
    let elements = REQUIRED_ELEMENTS
        .iter()
        .map(|&(name, plugins)| ElementStatus {
            name,
            plugins,
            available: gstreamer.is_some() && has_element(name),
        })
        .collect();

    let (ffmpeg, ffmpeg_error) =
        match capsule_transcode_engine::ffmpeg_version(&config.transcode.ffmpeg_path).await {
            Ok(version) => (Some(version), None),
            Err(e) => (None, Some(e.to_string())),
        };

    let memory = SystemHeapProbe::new(config.monitor.heap_limit_bytes)
        .sample()
        .map_err(|e| tracing::warn!(error = %e, "Memory sample failed"))
        .ok();

    let path = config_file_path();
    CheckReport {
        gstreamer,
        elements,
        ffmpeg,
        ffmpeg_error,
        memory,
        config_exists: path.exists(),
        config_path: path.display().to_string(),
    }
}

pub async fn run(config: &AppConfig, json: bool) -> anyhow::Result<()> {
    let report = collect(config).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Capsule System Check");
    println!("{}", "=".repeat(50));

    match &report.gstreamer {
        Some(version) => println!("[OK] GStreamer: {version}"),
        None => println!("[MISSING] GStreamer: failed to initialise"),
    }
    for element in &report.elements {
        if element.available {
            println!("[OK] {}", element.name);
        } else {
            println!("[MISSING] {} (install {})", element.name, element.plugins);
        }
    }

    println!();
    match (&report.ffmpeg, &report.ffmpeg_error) {
        (Some(version), _) => println!("[OK] ffmpeg: {version}"),
        (None, Some(err)) => println!("[MISSING] ffmpeg: {err}"),
        (None, None) => println!("[MISSING] ffmpeg"),
    }

    if let Some(sample) = &report.memory {
        println!(
            "[OK] Memory: {} MiB used of {} MiB ({:.1}%)",
            sample.used_bytes / (1024 * 1024),
            sample.limit_bytes / (1024 * 1024),
            sample.usage_ratio() * 100.0
        );
    } else {
        println!("[WARN] Memory: unavailable");
    }

    println!(
        "[{}] Config: {}",
        if report.config_exists { "OK" } else { "DEFAULT" },
        report.config_path
    );

    println!();
    match (report.capture_ready(), report.transcode_ready()) {
        (true, true) => println!("Capture and conversion are available. Capsule is ready."),
        (true, false) => println!("Capture is available; conversion needs ffmpeg."),
        (false, true) => {
            println!("Conversion is available; live capture is missing plugins (use --synthetic).")
        }
        (false, false) => println!("Some required components are missing. See above for fixes."),
    }

    Ok(())
}
