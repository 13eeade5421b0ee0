//! Capsule Common Utilities
//!
//! Shared infrastructure for all Capsule crates:
//! - Error taxonomy and result aliases
//! - Capture device and resource kind vocabulary
//! - Session clock and chunk pacing
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod kind;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use kind::*;
