//! Reference transcoder adapter: ffmpeg as a child process.
//!
//! Progress is observed the blunt way the engine expects: each stderr read
//! is one poll, and the poll reports the current output-file size. H.265 at
//! the configured CRF, like the preset the agent has always shipped with.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};

use vidvault_core::errors::{EngineError, EngineResult};
use vidvault_core::ports::{TranscodeRequest, TranscodeRun, TranscodeTick, Transcoder};

/// Spawns `ffmpeg` for each request.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder;

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, request: TranscodeRequest) -> EngineResult<Box<dyn TranscodeRun>> {
        let mut child = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(&request.input)
            .args(["-vcodec", "libx265"])
            .args(["-crf", &request.crf.to_string()])
            .args(["-preset", "slow", "-tune", "zerolatency"])
            .arg(&request.output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::from_io(&e))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::other("ffmpeg stderr not captured"))?;

        Ok(Box::new(FfmpegRun {
            child,
            stderr,
            output: request.output,
            buf: vec![0; 4096],
        }))
    }
}

struct FfmpegRun {
    child: Child,
    stderr: ChildStderr,
    output: PathBuf,
    buf: Vec<u8>,
}

#[async_trait]
impl TranscodeRun for FfmpegRun {
    async fn poll(&mut self) -> EngineResult<Option<TranscodeTick>> {
        let read = self
            .stderr
            .read(&mut self.buf)
            .await
            .map_err(|e| EngineError::from_io(&e))?;
        if read == 0 {
            // stderr closed: the process is done, check how it went.
            let status = self
                .child
                .wait()
                .await
                .map_err(|e| EngineError::from_io(&e))?;
            if status.success() {
                return Ok(None);
            }
            return Err(EngineError::other(format!("ffmpeg exited with {status}")));
        }
        let output_bytes = tokio::fs::metadata(&self.output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(Some(TranscodeTick { output_bytes }))
    }

    async fn abort(&mut self) -> EngineResult<()> {
        self.child
            .start_kill()
            .map_err(|e| EngineError::from_io(&e))?;
        let _ = self.child.wait().await;
        Ok(())
    }
}
