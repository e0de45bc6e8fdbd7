//! Downloader: resumable byte-stream fetch with retry, backoff, rate
//! limiting, and admission control.
//!
//! The byte loop never throws across the task boundary: it returns a
//! [`StreamOutcome`] and the attempt driver interprets it. The `.temp`
//! sidecar is the resume point and is only deleted when it is provably
//! oversized; every other exit preserves it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use vidvault_core::board::{LINE_INFO, LINE_LAST_ERROR, LINE_PINNED, LINE_TARGET_FOLDER};
use vidvault_core::config::Config;
use vidvault_core::errors::{EngineError, EngineResult};
use vidvault_core::job::{JobPatch, JobRecord, JobStatus};
use vidvault_core::ports::{ChatTransport, DiskProbe, MediaSource};
use vidvault_core::util::fmt::abbreviate_path;
use vidvault_rules::{RuleContext, RuleEngine};
use vidvault_store::JobStore;

use crate::postprocess::PostProcessor;
use crate::reporter::{ProgressSink, Reporter};

/// Per-run retry budget.
pub const RETRY_ATTEMPTS: u32 = 20;

const TRANSIENT_WAIT: Duration = Duration::from_secs(10);
/// Wait before comparing the `.temp` size against the expected size; late
/// writes may still be landing when the stream ends.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

const MIN_CHUNK_DELAY_SECS: f64 = 0.5;
const MAX_CHUNK_DELAY_SECS: f64 = 2.0;

const KIB: u64 = 1024;
const MIN_CHUNK_KIB: u64 = 64;
const NON_PREMIUM_MAX_KIB: u64 = 256;
const PREMIUM_DEFAULT_MAX_KIB: u64 = 1024;

/// How one byte-stream pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The stream ran dry; sizes still need comparing.
    Done,
    /// Retryable; wait this long first.
    Transient { wait: Duration, reason: String },
    /// `.temp` grew past the advertised size.
    Corrupted,
    /// Not retryable.
    Fatal { reason: String },
    /// Cancellation observed between chunks.
    Cancelled,
}

/// Final verdict of a full `run` (all retries included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEnd {
    Completed,
    Cancelled,
    /// Admission failed on free space; the scheduler must stop the loop.
    DiskFull,
    /// Terminal failure; the job record is preserved for diagnosis.
    Failed,
    /// Retry budget exhausted; the job stays queued for a later tick.
    Exhausted,
}

/// What the scheduler should do with a job this tick.
#[derive(Debug)]
pub enum PrepOutcome {
    Ready(Box<JobRecord>),
    Skip,
}

enum AttemptEnd {
    Completed,
    Retry { wait: Duration, reason: String },
    DiskFull,
    Cancelled,
    Fatal(String),
}

/// Everything a download worker needs, cloned Arcs only.
pub struct DownloaderDeps {
    pub transport: Arc<dyn ChatTransport>,
    pub store: Arc<JobStore>,
    pub reporter: Arc<Reporter>,
    pub rules: Arc<Mutex<RuleEngine>>,
    pub post: Arc<PostProcessor>,
    pub disk: Arc<dyn DiskProbe>,
    pub config: Arc<Config>,
}

/// The download worker.
pub struct Downloader {
    transport: Arc<dyn ChatTransport>,
    store: Arc<JobStore>,
    reporter: Arc<Reporter>,
    rules: Arc<Mutex<RuleEngine>>,
    post: Arc<PostProcessor>,
    disk: Arc<dyn DiskProbe>,
    config: Arc<Config>,
}

impl Downloader {
    #[must_use]
    pub fn new(deps: DownloaderDeps) -> Self {
        Self {
            transport: deps.transport,
            store: deps.store,
            reporter: deps.reporter,
            rules: deps.rules,
            post: deps.post,
            disk: deps.disk,
            config: deps.config,
        }
    }

    /// Pre-admission pass, run by the scheduler each tick.
    ///
    /// Checks the mirror (and, for protected jobs, the source) still
    /// exists, syncs the pin flag from the mirror, re-binds the job's rule,
    /// and re-derives the target folder.
    pub async fn prep(&self, mut job: JobRecord) -> EngineResult<PrepOutcome> {
        let chat = &self.config.personal_chat;
        let Some(mirror) = self.transport.fetch_message(chat, job.mirror_msg_id).await? else {
            tracing::info!(job = job.mirror_msg_id, "mirror gone, dropping job");
            let _ = self.store.delete(job.mirror_msg_id);
            return Ok(PrepOutcome::Skip);
        };

        if job.forward_protected
            && self
                .transport
                .fetch_message(&job.source_chat, job.source_msg_id)
                .await?
                .is_none()
        {
            tracing::info!(job = job.mirror_msg_id, "protected source gone, dropping job");
            let _ = self.transport.delete_message(chat, job.mirror_msg_id).await;
            let _ = self.store.delete(job.mirror_msg_id);
            return Ok(PrepOutcome::Skip);
        }

        if mirror.pinned != job.pinned {
            job.pinned = mirror.pinned;
            let patch = JobPatch {
                pinned: Some(job.pinned),
                ..JobPatch::default()
            };
            if let Err(e) = self.store.merge(job.mirror_msg_id, &patch) {
                tracing::warn!(job = job.mirror_msg_id, error = %e, "pin sync failed");
            }
            let text = if job.pinned { "pinned" } else { "" };
            self.reporter
                .set_line_with_icon(job.mirror_msg_id, LINE_PINNED, text)
                .await;
        }

        // Re-bind the owning rule (the bound map is in-memory) and derive
        // the completed folder from it.
        let derived = {
            let mut rules = self.rules.lock().unwrap();
            let ctx = RuleContext {
                chat_id: job.origin_chat_id,
                chat_username: job.origin_chat_username.as_deref(),
                chat_title: job.origin_chat_title.as_deref(),
                file_name: &job.file_name,
                artifact_id: job.artifact_id,
            };
            let _ = rules.apply_translate(&job.original_name, &ctx);
            rules.apply_folder(&job.original_name, job.artifact_id)
        };
        if let Some(folder) = derived {
            let folder = PathBuf::from(&folder);
            let folder = if folder.is_absolute() {
                folder
            } else {
                self.config.completed_folder.join(folder)
            };
            if folder != job.target_folder {
                job.target_folder.clone_from(&folder);
                let patch = JobPatch {
                    target_folder: Some(folder),
                    ..JobPatch::default()
                };
                if let Err(e) = self.store.merge(job.mirror_msg_id, &patch) {
                    tracing::warn!(job = job.mirror_msg_id, error = %e, "folder update failed");
                }
                self.reporter
                    .set_line_with_icon(
                        job.mirror_msg_id,
                        LINE_TARGET_FOLDER,
                        &abbreviate_path(&job.target_folder),
                    )
                    .await;
            }
        }

        Ok(PrepOutcome::Ready(Box::new(job)))
    }

    /// Drive one job to a terminal verdict, retries included.
    pub async fn run(&self, mut job: JobRecord, cancel: CancellationToken) -> DownloadEnd {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&job).await;
            }
            match self.attempt(&mut job, attempt, &cancel).await {
                AttemptEnd::Completed => return DownloadEnd::Completed,
                AttemptEnd::DiskFull => return DownloadEnd::DiskFull,
                AttemptEnd::Cancelled => return self.finish_cancelled(&job).await,
                AttemptEnd::Fatal(reason) => {
                    tracing::warn!(job = job.mirror_msg_id, reason = %reason, "download failed");
                    self.reporter
                        .set_status(job.mirror_msg_id, JobStatus::Error)
                        .await;
                    self.reporter
                        .set_line_with_icon(job.mirror_msg_id, LINE_LAST_ERROR, &reason)
                        .await;
                    self.unpin(&job).await;
                    return DownloadEnd::Failed;
                }
                AttemptEnd::Retry { wait, reason } => {
                    attempt += 1;
                    if attempt >= RETRY_ATTEMPTS {
                        tracing::warn!(
                            job = job.mirror_msg_id,
                            attempts = attempt,
                            "retry budget exhausted, job stays queued"
                        );
                        self.reporter
                            .set_line_with_icon(
                                job.mirror_msg_id,
                                LINE_LAST_ERROR,
                                "all retry attempts failed, retry on next pass",
                            )
                            .await;
                        self.reporter
                            .set_status(job.mirror_msg_id, JobStatus::Acquired)
                            .await;
                        return DownloadEnd::Exhausted;
                    }
                    tracing::debug!(
                        job = job.mirror_msg_id,
                        attempt,
                        wait_secs = wait.as_secs(),
                        reason = %reason,
                        "retrying"
                    );
                    self.reporter
                        .set_line_with_icon(job.mirror_msg_id, LINE_INFO, &reason)
                        .await;
                    tokio::select! {
                        () = cancel.cancelled() => return self.finish_cancelled(&job).await,
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// One admission-checked attempt.
    async fn attempt(
        &self,
        job: &mut JobRecord,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptEnd {
        // Admission 1: a finished, non-corrupted file short-circuits.
        if let Ok(meta) = std::fs::metadata(&job.staging_path) {
            if meta.len() >= job.size_bytes {
                self.reporter
                    .set_line_with_icon(job.mirror_msg_id, LINE_INFO, "ready to move")
                    .await;
                return self.complete(job).await;
            }
            self.reporter
                .set_line_with_icon(job.mirror_msg_id, LINE_LAST_ERROR, "corrupted file, redownloading")
                .await;
            let _ = std::fs::remove_file(&job.staging_path);
        }

        // Admission 2: target folder must exist (create recursively).
        if let Err(e) = vidvault_core::util::disk::ensure_writable_dir(&job.target_folder) {
            tracing::warn!(job = job.mirror_msg_id, error = %e, "target folder not usable");
            return AttemptEnd::Fatal("folder_not_exist".to_string());
        }

        // Admission 3+4: free space under both the target and the staging
        // filesystem, measured after deducting the artifact.
        for folder in [&job.target_folder, &self.config.download_folder] {
            match self.disk.space(folder) {
                Ok(space) => {
                    let free_pct = space.free_pct_after(job.size_bytes);
                    let limit = self.config.disk_space_limit_percentage;
                    if free_pct <= 100 - limit.min(100) {
                        tracing::warn!(
                            job = job.mirror_msg_id,
                            folder = %folder.display(),
                            free_pct,
                            "disk space admission failed"
                        );
                        self.reporter
                            .set_status(job.mirror_msg_id, JobStatus::Cancelled)
                            .await;
                        self.reporter
                            .set_line_with_icon(
                                job.mirror_msg_id,
                                LINE_LAST_ERROR,
                                &format!("not enough disk space under {}", folder.display()),
                            )
                            .await;
                        self.unpin(job).await;
                        return AttemptEnd::DiskFull;
                    }
                }
                Err(e) => {
                    tracing::warn!(folder = %folder.display(), error = %e, "disk probe failed");
                }
            }
        }

        // Admission 5: pin the mirror so active jobs surface in the chat.
        if let Err(e) = self
            .transport
            .pin_message(&self.config.personal_chat, job.mirror_msg_id)
            .await
        {
            tracing::debug!(job = job.mirror_msg_id, error = %e, "pin failed");
        }

        self.reporter
            .set_status(job.mirror_msg_id, JobStatus::Downloading)
            .await;

        match self.stream_once(job, attempt, cancel).await {
            StreamOutcome::Done => self.settle_and_verify(job, cancel).await,
            StreamOutcome::Transient { wait, reason } => AttemptEnd::Retry { wait, reason },
            StreamOutcome::Corrupted => {
                let _ = std::fs::remove_file(job.temp_path());
                self.reporter
                    .set_line_with_icon(job.mirror_msg_id, LINE_LAST_ERROR, "corrupted download discarded")
                    .await;
                AttemptEnd::Retry {
                    wait: Duration::ZERO,
                    reason: "restarting after corrupted download".to_string(),
                }
            }
            StreamOutcome::Fatal { reason } => AttemptEnd::Fatal(reason),
            StreamOutcome::Cancelled => AttemptEnd::Cancelled,
        }
    }

    /// One pass over the byte stream; errors are classified, not thrown.
    async fn stream_once(
        &self,
        job: &mut JobRecord,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        // Metadata is read fresh on every attempt: protected jobs stream
        // from the source, everything else from the mirror copy.
        let source = if job.forward_protected {
            MediaSource {
                chat: job.source_chat.clone(),
                message_id: job.source_msg_id,
            }
        } else {
            MediaSource {
                chat: self.config.personal_chat.clone(),
                message_id: job.mirror_msg_id,
            }
        };
        let message = match self.transport.fetch_message(&source.chat, source.message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return StreamOutcome::Fatal {
                    reason: "media message no longer exists".to_string(),
                };
            }
            Err(e) => return classify_transport_error(&e),
        };
        let Some(media) = message.media else {
            return StreamOutcome::Fatal {
                reason: "message lost its media".to_string(),
            };
        };
        if media.size_bytes != job.size_bytes {
            tracing::debug!(
                job = job.mirror_msg_id,
                was = job.size_bytes,
                now = media.size_bytes,
                "remote size changed"
            );
            job.size_bytes = media.size_bytes;
        }
        let expected = job.size_bytes;

        if let Some(parent) = job.staging_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return StreamOutcome::Fatal {
                    reason: format!("cannot create staging folder: {e}"),
                };
            }
        }

        let temp = job.temp_path();
        let offset = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        if offset > expected {
            return StreamOutcome::Corrupted;
        }

        let chunk_size = request_chunk_size(self.transport.is_premium(), self.config.request_limit_kb);
        let mut stream = match self.transport.open_stream(&source, offset, chunk_size).await {
            Ok(stream) => stream,
            Err(e) => return classify_transport_error(&e),
        };

        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&temp)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                return StreamOutcome::Fatal {
                    reason: format!("cannot open staging file: {e}"),
                };
            }
        };

        tracing::info!(
            job = job.mirror_msg_id,
            offset,
            expected,
            chunk_size,
            "streaming"
        );

        let mut sink = ProgressSink::new(Arc::clone(&self.reporter), job.mirror_msg_id, expected);
        let mut written = offset;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return StreamOutcome::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        return StreamOutcome::Fatal {
                            reason: format!("write failed: {e}"),
                        };
                    }
                    written += chunk.len() as u64;
                    sink.tick(written).await;
                    // Backpressure against upstream flood-wait.
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return StreamOutcome::Cancelled,
                        () = tokio::time::sleep(chunk_delay(attempt)) => {}
                    }
                }
                Some(Err(e)) => return classify_transport_error(&e),
                None => break,
            }
        }

        if let Err(e) = file.flush().await {
            return StreamOutcome::Fatal {
                reason: format!("flush failed: {e}"),
            };
        }
        sink.flush(written).await;
        StreamOutcome::Done
    }

    /// Post-stream settle, size compare, and handoff.
    async fn settle_and_verify(&self, job: &mut JobRecord, cancel: &CancellationToken) -> AttemptEnd {
        tokio::select! {
            () = cancel.cancelled() => return AttemptEnd::Cancelled,
            () = tokio::time::sleep(SETTLE_DELAY) => {}
        }

        let temp = job.temp_path();
        let temp_size = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        let expected = job.size_bytes;

        if temp_size == expected {
            if let Err(e) = std::fs::rename(&temp, &job.staging_path) {
                return AttemptEnd::Fatal(format!("cannot finalize staging file: {e}"));
            }
            return self.complete(job).await;
        }
        if temp_size > expected {
            let _ = std::fs::remove_file(&temp);
            self.reporter
                .set_line_with_icon(job.mirror_msg_id, LINE_LAST_ERROR, "corrupted download discarded")
                .await;
            return AttemptEnd::Retry {
                wait: Duration::ZERO,
                reason: "restarting after corrupted download".to_string(),
            };
        }
        AttemptEnd::Retry {
            wait: TRANSIENT_WAIT,
            reason: format!(
                "stream ended early at {temp_size} of {expected} bytes, resuming"
            ),
        }
    }

    /// Hand off to the post-processor and mark the job completed.
    async fn complete(&self, job: &mut JobRecord) -> AttemptEnd {
        match self.post.finalize(job).await {
            Ok(final_path) => {
                let patch = JobPatch {
                    completed: Some(true),
                    ..JobPatch::default()
                };
                if let Err(e) = self.store.merge(job.mirror_msg_id, &patch) {
                    tracing::warn!(job = job.mirror_msg_id, error = %e, "completed flag not stored");
                }
                job.completed = true;
                self.reporter
                    .set_line_with_icon(job.mirror_msg_id, LINE_INFO, "download complete")
                    .await;
                self.reporter
                    .set_status(job.mirror_msg_id, JobStatus::Completed)
                    .await;
                self.unpin(job).await;
                tracing::info!(
                    job = job.mirror_msg_id,
                    path = %final_path.display(),
                    "job completed"
                );
                AttemptEnd::Completed
            }
            Err(e) => AttemptEnd::Fatal(format!("placement failed: {e}")),
        }
    }

    async fn finish_cancelled(&self, job: &JobRecord) -> DownloadEnd {
        tracing::info!(job = job.mirror_msg_id, "download cancelled, temp preserved");
        self.reporter
            .set_status(job.mirror_msg_id, JobStatus::Cancelled)
            .await;
        self.unpin(job).await;
        DownloadEnd::Cancelled
    }

    async fn unpin(&self, job: &JobRecord) {
        if let Err(e) = self
            .transport
            .unpin_message(&self.config.personal_chat, job.mirror_msg_id)
            .await
        {
            tracing::debug!(job = job.mirror_msg_id, error = %e, "unpin failed");
        }
    }
}

/// Map a transport error to a stream outcome; only the retry policy knows
/// the waits.
fn classify_transport_error(err: &EngineError) -> StreamOutcome {
    match err {
        EngineError::FloodWait { seconds } => StreamOutcome::Transient {
            wait: Duration::from_secs(seconds + 1),
            reason: format!("rate limited, waiting {}s", seconds + 1),
        },
        EngineError::Transport { message } => StreamOutcome::Transient {
            wait: TRANSIENT_WAIT,
            reason: format!("transport error, retrying: {message}"),
        },
        EngineError::Cancelled => StreamOutcome::Cancelled,
        other => StreamOutcome::Fatal {
            reason: other.to_string(),
        },
    }
}

/// Chunk request size from entitlement and config ceiling.
#[must_use]
pub fn request_chunk_size(premium: bool, limit_kb: u64) -> usize {
    let kib = if premium {
        let ceiling = if limit_kb == 0 {
            PREMIUM_DEFAULT_MAX_KIB
        } else {
            limit_kb
        };
        ceiling.max(MIN_CHUNK_KIB)
    } else {
        let ceiling = if limit_kb == 0 { NON_PREMIUM_MAX_KIB } else { limit_kb };
        ceiling.clamp(MIN_CHUNK_KIB, NON_PREMIUM_MAX_KIB)
    };
    usize::try_from(kib * KIB).unwrap_or(usize::MAX)
}

/// Inter-chunk backpressure: slow on the first attempt, settling to the
/// floor once the job has been retried.
#[must_use]
pub fn chunk_delay(attempt: u32) -> Duration {
    let spread = MAX_CHUNK_DELAY_SECS - MIN_CHUNK_DELAY_SECS;
    let scale = f64::from(1u32.saturating_sub(attempt)) / f64::from(RETRY_ATTEMPTS);
    Duration::from_secs_f64(spread.mul_add(scale, MIN_CHUNK_DELAY_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_respects_entitlement() {
        assert_eq!(request_chunk_size(false, 0), 256 * 1024);
        assert_eq!(request_chunk_size(false, 128), 128 * 1024);
        // Non-premium never exceeds 256 KiB and never drops under 64 KiB.
        assert_eq!(request_chunk_size(false, 4096), 256 * 1024);
        assert_eq!(request_chunk_size(false, 1), 64 * 1024);
        // Premium honors the configured ceiling.
        assert_eq!(request_chunk_size(true, 0), 1024 * 1024);
        assert_eq!(request_chunk_size(true, 2048), 2048 * 1024);
    }

    #[test]
    fn chunk_delay_decays_to_floor() {
        let first = chunk_delay(0);
        let later = chunk_delay(1);
        assert!(first > later);
        assert_eq!(later, Duration::from_secs_f64(0.5));
        assert_eq!(chunk_delay(19), Duration::from_secs_f64(0.5));
    }

    #[test]
    fn flood_wait_gets_plus_one_second() {
        let outcome = classify_transport_error(&EngineError::FloodWait { seconds: 7 });
        match outcome {
            StreamOutcome::Transient { wait, .. } => {
                assert_eq!(wait, Duration::from_secs(8));
            }
            other => panic!("expected Transient, got {other:?}"),
        }
    }

    #[test]
    fn transient_transport_waits_ten_seconds() {
        let outcome = classify_transport_error(&EngineError::transport("reset by peer"));
        match outcome {
            StreamOutcome::Transient { wait, .. } => {
                assert_eq!(wait, Duration::from_secs(10));
            }
            other => panic!("expected Transient, got {other:?}"),
        }
    }

    #[test]
    fn filesystem_errors_are_fatal() {
        let io = EngineError::Io {
            kind: "PermissionDenied".to_string(),
            message: "denied".to_string(),
        };
        assert!(matches!(
            classify_transport_error(&io),
            StreamOutcome::Fatal { .. }
        ));
    }
}
