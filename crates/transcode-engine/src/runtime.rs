//! The codec runtime boundary.

use std::sync::Arc;

use capsule_common::error::CapsuleResult;

/// Progress reported while a command runs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TranscodeProgress {
    /// Media time written so far.
    pub out_time_secs: f64,
    /// Set on the final report.
    pub complete: bool,
}

pub type ProgressCallback = Arc<dyn Fn(TranscodeProgress) + Send + Sync>;

/// A codec runtime with its own file namespace.
///
/// File names are plain names inside the runtime's virtual filesystem,
/// never host paths.
#[async_trait::async_trait]
pub trait TranscodeRuntime: Send + Sync {
    /// Runtime name for logging.
    fn name(&self) -> &str;

    /// Prepare the runtime. Called once per engine before any other
    /// method.
    async fn load(&self) -> CapsuleResult<()>;

    async fn write_file(&self, name: &str, data: &[u8]) -> CapsuleResult<()>;

    /// Run one command. `args` never include the program name.
    async fn exec(&self, args: &[String], progress: Option<ProgressCallback>) -> CapsuleResult<()>;

    async fn read_file(&self, name: &str) -> CapsuleResult<Vec<u8>>;

    /// Remove a file. Removing a file that does not exist succeeds.
    async fn delete_file(&self, name: &str) -> CapsuleResult<()>;
}
