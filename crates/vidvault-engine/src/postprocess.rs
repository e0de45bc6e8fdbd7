//! Post-processing: optional transcode, then atomic placement.
//!
//! The transcoder is an external process watched through its output file:
//! if the reported size stops growing for [`STAGNANT_POLL_LIMIT`]
//! consecutive polls the run is aborted. Placement creates a per-title
//! subfolder under the job's target folder and moves the source file in,
//! rewriting `.mpv` to `.mp4` on the way.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use vidvault_core::board::{LINE_FILE_SIZE, LINE_INFO};
use vidvault_core::config::Config;
use vidvault_core::errors::{EngineError, EngineResult};
use vidvault_core::job::{JobRecord, JobStatus};
use vidvault_core::ports::{TranscodeRequest, Transcoder};
use vidvault_core::util::fmt::{format_bytes, format_percent};
use vidvault_core::util::sanitize::sanitize_filename;
use vidvault_rules::RuleEngine;

use crate::progress::ProgressThrottle;
use crate::reporter::Reporter;

/// Consecutive stagnant polls before a transcode is declared stuck.
pub const STAGNANT_POLL_LIMIT: u32 = 30;

const MIB: u64 = 1024 * 1024;

/// CRF-parameterised output-size factor.
#[must_use]
pub fn compression_factor(crf: u8) -> f64 {
    match crf {
        0..=18 => 1.2,
        19..=23 => 1.0,
        24..=28 => 0.75,
        _ => 0.5,
    }
}

/// Estimated output size for an input of `size_bytes` at `crf`.
#[must_use]
pub fn estimated_output_bytes(size_bytes: u64, crf: u8) -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    {
        (size_bytes as f64 * compression_factor(crf)) as u64
    }
}

/// Transcode-then-place stage.
pub struct PostProcessor {
    transcoder: Arc<dyn Transcoder>,
    reporter: Arc<Reporter>,
    rules: Arc<Mutex<RuleEngine>>,
    config: Arc<Config>,
}

impl PostProcessor {
    #[must_use]
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        reporter: Arc<Reporter>,
        rules: Arc<Mutex<RuleEngine>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            transcoder,
            reporter,
            rules,
            config,
        }
    }

    /// Finish a downloaded job: maybe transcode, then move into place.
    ///
    /// Returns the final path. On move failure the rule engine is reloaded
    /// (the operator may have been editing rules to fix a bad target) and
    /// the error is returned for the caller to mark the job ERROR.
    pub async fn finalize(&self, job: &JobRecord) -> EngineResult<PathBuf> {
        let mut source = job.staging_path.clone();

        if self.should_transcode(job) {
            match self.transcode(job, &source).await {
                Ok(Some(compressed)) => {
                    if let Err(e) = std::fs::remove_file(&source) {
                        tracing::warn!(file = %source.display(), error = %e, "original not removed");
                    }
                    source = compressed;
                }
                Ok(None) => {} // estimate said the transcode would not help
                Err(e) => {
                    // A failed transcode does not lose the artifact: place
                    // the original and surface the failure on the board.
                    tracing::warn!(job = job.mirror_msg_id, error = %e, "transcode failed");
                    self.reporter
                        .set_line_with_icon(
                            job.mirror_msg_id,
                            vidvault_core::board::LINE_LAST_ERROR,
                            &format!("compression failed: {e}"),
                        )
                        .await;
                }
            }
        }

        let dest = self.place(job, &source).await?;
        Ok(dest)
    }

    fn should_transcode(&self, job: &JobRecord) -> bool {
        self.config.enable_video_compression
            && job.size_bytes > self.config.compression_min_size_mb * MIB
    }

    /// Run the transcoder with the stagnation watchdog.
    ///
    /// Returns `Ok(None)` when the CRF estimate says compression would not
    /// shrink the file.
    async fn transcode(&self, job: &JobRecord, input: &Path) -> EngineResult<Option<PathBuf>> {
        let crf = self.config.compression_ratio;
        let input_size = std::fs::metadata(input)
            .map_err(|e| EngineError::from_io(&e))?
            .len();
        let estimate = estimated_output_bytes(input_size, crf);
        if estimate >= input_size {
            tracing::debug!(
                job = job.mirror_msg_id,
                crf,
                "estimate exceeds input, skipping transcode"
            );
            return Ok(None);
        }

        self.reporter
            .set_status(job.mirror_msg_id, JobStatus::Compressing)
            .await;
        self.reporter
            .set_line_with_icon(
                job.mirror_msg_id,
                LINE_FILE_SIZE,
                &format!(
                    "{} (\u{2192} ~{})",
                    format_bytes(input_size),
                    format_bytes(estimate)
                ),
            )
            .await;

        let mut output = input.as_os_str().to_owned();
        output.push(".compressed.mp4");
        let output = PathBuf::from(output);

        let mut run = self
            .transcoder
            .spawn(TranscodeRequest {
                input: input.to_path_buf(),
                output: output.clone(),
                crf,
            })
            .await?;

        let mut throttle = ProgressThrottle::default();
        let mut last_size = 0u64;
        let mut stagnant = 0u32;
        loop {
            match run.poll().await {
                Ok(Some(tick)) => {
                    if tick.output_bytes == last_size {
                        stagnant += 1;
                        if stagnant >= STAGNANT_POLL_LIMIT {
                            let _ = run.abort().await;
                            let _ = std::fs::remove_file(&output);
                            return Err(EngineError::other("compression stalled"));
                        }
                    } else {
                        last_size = tick.output_bytes;
                        stagnant = 0;
                    }
                    if throttle.should_emit() {
                        self.reporter
                            .set_line_with_icon(
                                job.mirror_msg_id,
                                LINE_INFO,
                                &format!(
                                    "\u{1f5dc}\u{fe0f} {} of ~{} ({})",
                                    format_bytes(tick.output_bytes),
                                    format_bytes(estimate),
                                    format_percent(tick.output_bytes, estimate),
                                ),
                            )
                            .await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = run.abort().await;
                    let _ = std::fs::remove_file(&output);
                    return Err(e);
                }
            }
        }

        let final_size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if final_size == 0 {
            let _ = std::fs::remove_file(&output);
            return Err(EngineError::other("transcoder produced no output"));
        }
        tracing::info!(
            job = job.mirror_msg_id,
            from = input_size,
            to = final_size,
            "transcode complete"
        );
        Ok(Some(output))
    }

    /// Move `source` into `<target_folder>/<title>/<title>.<ext>`.
    async fn place(&self, job: &JobRecord, source: &Path) -> EngineResult<PathBuf> {
        let title = sanitize_filename(&job.display_name);
        let title = if title.is_empty() {
            sanitize_filename(&job.file_name)
        } else {
            title
        };
        let folder = job.target_folder.join(&title);

        let placed = vidvault_core::util::disk::ensure_writable_dir(&folder)
            .and_then(|()| {
                let ext = source
                    .extension()
                    .and_then(|e| e.to_str())
                    .map_or_else(|| "mp4".to_string(), str::to_ascii_lowercase);
                let ext = if ext == "mpv" { "mp4".to_string() } else { ext };
                let dest = folder.join(format!("{title}.{ext}"));
                move_file(source, &dest)?;
                Ok(dest)
            });

        match placed {
            Ok(dest) => {
                tracing::info!(job = job.mirror_msg_id, dest = %dest.display(), "placed");
                Ok(dest)
            }
            Err(e) => {
                tracing::warn!(
                    job = job.mirror_msg_id,
                    target = %job.target_folder.display(),
                    error = %e,
                    "placement failed, reloading rules"
                );
                self.rules.lock().unwrap().reload();
                Err(e)
            }
        }
    }
}

/// Rename, falling back to copy+remove across filesystems.
fn move_file(source: &Path, dest: &Path) -> EngineResult<()> {
    match std::fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(source, dest).map_err(|e| EngineError::from_io(&e))?;
            std::fs::remove_file(source).map_err(|e| EngineError::from_io(&e))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_brackets() {
        assert!((compression_factor(18) - 1.2).abs() < f64::EPSILON);
        assert!((compression_factor(23) - 1.0).abs() < f64::EPSILON);
        assert!((compression_factor(28) - 0.75).abs() < f64::EPSILON);
        assert!((compression_factor(35) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn estimate_scales_input() {
        assert_eq!(estimated_output_bytes(1000, 28), 750);
        assert_eq!(estimated_output_bytes(1000, 51), 500);
        // Low CRF estimates above the input, which callers read as "skip".
        assert!(estimated_output_bytes(1000, 10) >= 1000);
    }

    #[test]
    fn move_file_renames_within_fs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("b.bin");
        std::fs::write(&src, b"payload").unwrap();
        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }
}
