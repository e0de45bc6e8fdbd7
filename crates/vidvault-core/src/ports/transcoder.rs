//! Transcoder port.
//!
//! The transcoder is an external process that writes an output file and
//! emits progress; the engine polls it and watches the output size grow.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::EngineResult;

/// A transcode invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Constant rate factor, clamped to 0..=51 by config.
    pub crf: u8,
}

/// One progress observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeTick {
    /// Current size of the output file.
    pub output_bytes: u64,
}

/// A running transcode.
#[async_trait]
pub trait TranscodeRun: Send {
    /// Wait for the next progress observation.
    ///
    /// Returns `Ok(Some(tick))` while the process runs, `Ok(None)` once it
    /// has exited successfully, and an error when it exited non-zero.
    async fn poll(&mut self) -> EngineResult<Option<TranscodeTick>>;

    /// Kill the process and discard the partial output.
    async fn abort(&mut self) -> EngineResult<()>;
}

/// Factory for transcode runs.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Spawn the transcoder process for `request`.
    async fn spawn(&self, request: TranscodeRequest) -> EngineResult<Box<dyn TranscodeRun>>;
}
