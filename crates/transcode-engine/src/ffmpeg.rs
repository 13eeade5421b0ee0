//! Native ffmpeg process runtime.
//!
//! The virtual filesystem is a private directory under the configured
//! scratch root, created on load and removed when the runtime is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use capsule_common::config::TranscodeConfig;
use capsule_common::error::{CapsuleError, CapsuleResult};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::runtime::{ProgressCallback, TranscodeProgress, TranscodeRuntime};

const STALL_WARN_SECS: u64 = 10;

pub struct FfmpegRuntime {
    binary: PathBuf,
    scratch_root: PathBuf,
    workdir: Mutex<Option<PathBuf>>,
}

impl FfmpegRuntime {
    pub fn new(binary: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_root: scratch_root.into(),
            workdir: Mutex::new(None),
        }
    }

    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self::new(&config.ffmpeg_path, &config.scratch_dir)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// The virtual filesystem root, once loaded.
    pub fn workdir(&self) -> Option<PathBuf> {
        self.workdir.lock().clone()
    }

    fn resolve(&self, name: &str) -> CapsuleResult<PathBuf> {
        let workdir = self
            .workdir()
            .ok_or_else(|| CapsuleError::transcode_load("ffmpeg runtime is not loaded"))?;
        let is_plain = !name.is_empty()
            && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
        if !is_plain {
            return Err(CapsuleError::transcode_exec(format!(
                "Invalid virtual file name: {name}"
            )));
        }
        Ok(workdir.join(name))
    }
}

/// Version line of an ffmpeg binary, if it runs.
pub async fn ffmpeg_version(binary: &Path) -> CapsuleResult<String> {
    let output = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            CapsuleError::transcode_load(format!("Failed to run {}: {e}", binary.display()))
        })?;
    if !output.status.success() {
        return Err(CapsuleError::transcode_load(format!(
            "{} -version exited with {}",
            binary.display(),
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

#[async_trait::async_trait]
impl TranscodeRuntime for FfmpegRuntime {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn load(&self) -> CapsuleResult<()> {
        let version = ffmpeg_version(&self.binary).await?;

        let workdir = self.scratch_root.join(format!(
            "transcode-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&workdir).await.map_err(|e| {
            CapsuleError::transcode_load(format!(
                "Cannot create scratch directory {}: {e}",
                workdir.display()
            ))
        })?;
        tracing::info!(%version, workdir = %workdir.display(), "ffmpeg runtime loaded");
        *self.workdir.lock() = Some(workdir);
        Ok(())
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> CapsuleResult<()> {
        let path = self.resolve(name)?;
        tokio::fs::write(&path, data).await?;
        tracing::debug!(name, bytes = data.len(), "Virtual file written");
        Ok(())
    }

    async fn exec(&self, args: &[String], progress: Option<ProgressCallback>) -> CapsuleResult<()> {
        let workdir = self
            .workdir()
            .ok_or_else(|| CapsuleError::transcode_load("ffmpeg runtime is not loaded"))?;

        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&workdir)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-nostats"])
            .args(["-progress", "pipe:1"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(?args, "Running ffmpeg");
        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| CapsuleError::transcode_exec(format!("Failed to start ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapsuleError::transcode_exec("Failed to capture ffmpeg stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| CapsuleError::transcode_exec("Failed to capture ffmpeg stderr"))?;

        // ffmpeg blocks on a full stderr pipe, so drain it alongside stdout.
        let stderr_task = tokio::spawn(async move {
            let mut output = String::new();
            match stderr.read_to_string(&mut output).await {
                Ok(_) => output,
                Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut state = ProgressState::default();
        let mut last_advance = Instant::now();
        let mut last_secs = 0.0f64;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| CapsuleError::transcode_exec(format!("Failed reading ffmpeg progress: {e}")))?
        {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            state.update(key, value);
            if key != "progress" {
                continue;
            }
            if state.progress.out_time_secs > last_secs + 0.001 {
                last_secs = state.progress.out_time_secs;
                last_advance = Instant::now();
            } else if last_advance.elapsed().as_secs() >= STALL_WARN_SECS {
                tracing::warn!(
                    out_time_secs = last_secs,
                    elapsed_secs = start.elapsed().as_secs_f64(),
                    "No ffmpeg progress advancement for {STALL_WARN_SECS}s"
                );
                last_advance = Instant::now();
            }
            if let Some(cb) = &progress {
                cb(state.progress);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CapsuleError::transcode_exec(format!("Failed to wait on ffmpeg: {e}")))?;
        let stderr_output = stderr_task
            .await
            .unwrap_or_else(|_| "<failed to join stderr reader>".to_string());

        if !status.success() {
            return Err(CapsuleError::transcode_exec(format!(
                "ffmpeg exited with {status}: {}",
                stderr_output.trim()
            )));
        }
        tracing::debug!(elapsed_secs = start.elapsed().as_secs_f64(), "ffmpeg finished");
        Ok(())
    }

    async fn read_file(&self, name: &str) -> CapsuleResult<Vec<u8>> {
        let path = self.resolve(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn delete_file(&self, name: &str) -> CapsuleResult<()> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FfmpegRuntime {
    fn drop(&mut self) {
        if let Some(workdir) = self.workdir.get_mut().take() {
            if let Err(e) = std::fs::remove_dir_all(&workdir) {
                tracing::debug!(workdir = %workdir.display(), error = %e, "Scratch directory not removed");
            }
        }
    }
}

/// Accumulates `key=value` lines from `-progress` output.
#[derive(Debug, Default)]
struct ProgressState {
    progress: TranscodeProgress,
}

impl ProgressState {
    fn update(&mut self, key: &str, value: &str) {
        match key {
            // ffmpeg reports microseconds under both names.
            "out_time_ms" | "out_time_us" => {
                if let Ok(us) = value.parse::<f64>() {
                    self.progress.out_time_secs = us / 1_000_000.0;
                }
            }
            "progress" => {
                self.progress.complete = value == "end";
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_update_state() {
        let mut state = ProgressState::default();
        state.update("out_time_us", "2500000");
        state.update("progress", "continue");
        assert_eq!(state.progress.out_time_secs, 2.5);
        assert!(!state.progress.complete);

        state.update("out_time_ms", "not-a-number");
        state.update("progress", "end");
        assert_eq!(state.progress.out_time_secs, 2.5);
        assert!(state.progress.complete);
    }

    #[tokio::test]
    async fn virtual_names_stay_inside_workdir() {
        let scratch = tempfile::tempdir().unwrap();
        let runtime = FfmpegRuntime::new("ffmpeg", scratch.path());
        assert!(runtime.resolve("input.y4m").is_err());

        let workdir = scratch.path().join("vfs");
        std::fs::create_dir_all(&workdir).unwrap();
        *runtime.workdir.lock() = Some(workdir.clone());

        assert_eq!(runtime.resolve("input.y4m").unwrap(), workdir.join("input.y4m"));
        assert!(runtime.resolve("../escape").is_err());
        assert!(runtime.resolve("a/b").is_err());

        runtime.write_file("input.y4m", b"abc").await.unwrap();
        assert_eq!(runtime.read_file("input.y4m").await.unwrap(), b"abc");
        runtime.delete_file("input.y4m").await.unwrap();
        runtime.delete_file("input.y4m").await.unwrap();
        assert!(!workdir.join("input.y4m").exists());

        drop(runtime);
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn missing_binary_is_a_load_error() {
        let scratch = tempfile::tempdir().unwrap();
        let runtime = FfmpegRuntime::new("/nonexistent/ffmpeg-binary", scratch.path());
        let err = runtime.load().await.unwrap_err();
        assert!(matches!(err, CapsuleError::TranscodeLoad { .. }));
        assert!(runtime.workdir().is_none());
    }
}
