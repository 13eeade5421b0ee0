//! Runs conversions against a [`TranscodeRuntime`].

use std::sync::Arc;
use std::time::Instant;

use capsule_common::error::{CapsuleError, CapsuleResult};
use capsule_platform_core::Blob;
use tokio::sync::{Mutex, OnceCell};

use crate::command::{build_command, input_name, output_name};
use crate::options::{TranscodeRequest, TranscodeResult};
use crate::runtime::{ProgressCallback, TranscodeProgress, TranscodeRuntime};

/// Virtual files written for one conversion. Removed by
/// [`VirtualFiles::remove`]; if the conversion future is dropped first,
/// removal is handed to a background task.
struct VirtualFiles {
    runtime: Arc<dyn TranscodeRuntime>,
    names: Vec<String>,
    armed: bool,
}

impl VirtualFiles {
    fn new(runtime: Arc<dyn TranscodeRuntime>, names: Vec<String>) -> Self {
        Self {
            runtime,
            names,
            armed: true,
        }
    }

    async fn remove(mut self) {
        self.armed = false;
        delete_all(self.runtime.as_ref(), &self.names).await;
    }
}

impl Drop for VirtualFiles {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let runtime = self.runtime.clone();
        let names = std::mem::take(&mut self.names);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { delete_all(runtime.as_ref(), &names).await });
            }
            Err(_) => tracing::warn!(?names, "No runtime to remove virtual files on"),
        }
    }
}

async fn delete_all(runtime: &dyn TranscodeRuntime, names: &[String]) {
    for name in names {
        if let Err(e) = runtime.delete_file(name).await {
            tracing::warn!(name, error = %e, "Failed to delete virtual file");
        }
    }
}

/// Converts raw clips. Create one per process and share it.
pub struct TranscodeEngine {
    runtime: Arc<dyn TranscodeRuntime>,
    loaded: OnceCell<()>,
    /// Virtual file names are fixed, so conversions run one at a time.
    lane: Mutex<()>,
    progress: Option<ProgressCallback>,
}

impl TranscodeEngine {
    pub fn new(runtime: Arc<dyn TranscodeRuntime>) -> Self {
        Self {
            runtime,
            loaded: OnceCell::new(),
            lane: Mutex::new(()),
            progress: None,
        }
    }

    /// Report runtime progress to `callback` during every conversion.
    pub fn with_progress(
        mut self,
        callback: impl Fn(TranscodeProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    /// Load the runtime once. Concurrent callers share one load; a failed
    /// load leaves the engine unloaded so the next call tries again.
    pub async fn load(&self) -> CapsuleResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                let start = Instant::now();
                self.runtime.load().await.map_err(|e| match e {
                    CapsuleError::TranscodeLoad { .. } => e,
                    other => CapsuleError::transcode_load(other.to_string()),
                })?;
                tracing::info!(
                    runtime = self.runtime.name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Transcode runtime loaded"
                );
                Ok::<(), CapsuleError>(())
            })
            .await
            .map(|_| ())
    }

    /// Convert one clip.
    ///
    /// Both virtual files are removed whether or not the conversion
    /// succeeds, before any error is returned.
    pub async fn convert(&self, request: TranscodeRequest) -> CapsuleResult<TranscodeResult> {
        self.load().await?;
        let _lane = self.lane.lock().await;

        let format = request.target_format();
        let input = input_name(&request);
        let output = output_name(format);
        let args = build_command(&request, &input, &output);
        tracing::info!(
            %format,
            tier = %request.quality_tier(),
            input_bytes = request.input().size(),
            include_audio = request.include_audio(),
            "Converting clip"
        );

        let start = Instant::now();
        let files = VirtualFiles::new(self.runtime.clone(), vec![input.clone(), output.clone()]);
        let outcome = self.run(&request, &input, &output, &args).await;
        files.remove().await;

        let bytes = outcome.map_err(|e| {
            tracing::warn!(error = %e, "Conversion failed");
            match e {
                CapsuleError::TranscodeExec { .. } => e,
                other => CapsuleError::transcode_exec(other.to_string()),
            }
        })?;

        let size = bytes.len();
        let elapsed = start.elapsed();
        tracing::info!(
            output_bytes = size,
            elapsed_ms = elapsed.as_millis() as u64,
            "Conversion finished"
        );
        Ok(TranscodeResult {
            blob: Blob::new(bytes, format.mime_type()),
            size,
            elapsed,
        })
    }

    async fn run(
        &self,
        request: &TranscodeRequest,
        input: &str,
        output: &str,
        args: &[String],
    ) -> CapsuleResult<Vec<u8>> {
        self.runtime
            .write_file(input, request.input().bytes())
            .await?;
        self.runtime.exec(args, self.progress.clone()).await?;
        let bytes = self.runtime.read_file(output).await?;
        if bytes.is_empty() {
            return Err(CapsuleError::transcode_exec("Runtime produced an empty output"));
        }
        Ok(bytes)
    }
}
