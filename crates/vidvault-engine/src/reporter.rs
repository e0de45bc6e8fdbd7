//! Progress reporter: edits the mirror message's board.
//!
//! Every edit reads the current text first, changes exactly one slot, and
//! writes back, so concurrent writers of different slots cannot clobber
//! each other's lines. Edits are best-effort: a failed edit is logged and
//! the pipeline carries on, because the board is a view, not state.

use std::sync::Arc;
use std::time::Duration;

use vidvault_core::board::{LINE_INFO, ProgressBoard};
use vidvault_core::errors::EngineResult;
use vidvault_core::job::JobStatus;
use vidvault_core::ports::ChatTransport;
use vidvault_core::util::fmt::{format_bytes, format_duration, format_percent};

use crate::progress::{ProgressThrottle, SpeedWindow};

/// Board editor for the operator chat.
pub struct Reporter {
    transport: Arc<dyn ChatTransport>,
    chat: String,
}

impl Reporter {
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, chat: impl Into<String>) -> Self {
        Self {
            transport,
            chat: chat.into(),
        }
    }

    /// The operator chat this reporter writes to.
    #[must_use]
    pub fn chat(&self) -> &str {
        &self.chat
    }

    /// Current board of a mirror message, if the message still exists.
    pub async fn board(&self, mirror_msg_id: i64) -> EngineResult<Option<ProgressBoard>> {
        Ok(self
            .transport
            .fetch_message(&self.chat, mirror_msg_id)
            .await?
            .map(|m| ProgressBoard::from_text(&m.text)))
    }

    /// Edit exactly one slot, preserving the others.
    pub async fn set_line(&self, mirror_msg_id: i64, slot: usize, text: &str) {
        self.edit(mirror_msg_id, |board| board.set_line(slot, text))
            .await;
    }

    /// Edit one slot with the slot's default icon prefixed.
    pub async fn set_line_with_icon(&self, mirror_msg_id: i64, slot: usize, text: &str) {
        self.edit(mirror_msg_id, |board| board.set_line_with_icon(slot, text))
            .await;
    }

    /// Edit the badge in slot 1.
    ///
    /// A board that reached `COMPLETED` never changes its badge again; late
    /// writers (a racing cleanup, a stale retry) are dropped here.
    pub async fn set_status(&self, mirror_msg_id: i64, status: JobStatus) {
        self.edit(mirror_msg_id, |board| {
            if board.status() == Some(JobStatus::Completed) {
                tracing::debug!(
                    mirror = mirror_msg_id,
                    requested = %status,
                    "badge already COMPLETED, edit dropped"
                );
                return;
            }
            board.set_status(status);
        })
        .await;
    }

    async fn edit<F: FnOnce(&mut ProgressBoard)>(&self, mirror_msg_id: i64, apply: F) {
        let board = match self.board(mirror_msg_id).await {
            Ok(Some(board)) => board,
            Ok(None) => {
                tracing::debug!(mirror = mirror_msg_id, "mirror message gone, edit dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(mirror = mirror_msg_id, error = %e, "board read failed");
                return;
            }
        };
        let mut updated = board.clone();
        apply(&mut updated);
        if updated == board {
            return;
        }
        if let Err(e) = self
            .transport
            .edit_message(&self.chat, mirror_msg_id, &updated.render())
            .await
        {
            tracing::warn!(mirror = mirror_msg_id, error = %e, "board edit failed");
        }
    }

    /// Send an ephemeral service message that deletes itself after `ttl`.
    pub async fn service_message(&self, text: &str, ttl: Duration) {
        let text = format!("\u{1f514} {text}");
        match self.transport.send_message(&self.chat, &text).await {
            Ok(id) => {
                let transport = Arc::clone(&self.transport);
                let chat = self.chat.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if let Err(e) = transport.delete_message(&chat, id).await {
                        tracing::debug!(message = id, error = %e, "service message cleanup failed");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "service message send failed"),
        }
    }
}

/// Per-download progress sink, threaded into the byte loop.
///
/// Batches slot-7 edits on the reporter throttle and keeps the speed
/// window; the final state is flushed unconditionally on completion.
pub struct ProgressSink {
    reporter: Arc<Reporter>,
    mirror_msg_id: i64,
    total: u64,
    window: SpeedWindow,
    throttle: ProgressThrottle,
}

impl ProgressSink {
    #[must_use]
    pub fn new(reporter: Arc<Reporter>, mirror_msg_id: i64, total: u64) -> Self {
        Self {
            reporter,
            mirror_msg_id,
            total,
            window: SpeedWindow::new(),
            throttle: ProgressThrottle::default(),
        }
    }

    /// Record progress; edits the board when the throttle allows.
    pub async fn tick(&mut self, bytes_so_far: u64) {
        self.window.push(bytes_so_far);
        if self.throttle.should_emit() {
            self.write(bytes_so_far).await;
        }
    }

    /// Unthrottled final write.
    pub async fn flush(&mut self, bytes_so_far: u64) {
        self.window.push(bytes_so_far);
        self.write(bytes_so_far).await;
    }

    async fn write(&self, bytes_so_far: u64) {
        let mut info = format!(
            "\u{2b07}\u{fe0f} {} of {} ({})",
            format_bytes(bytes_so_far),
            format_bytes(self.total),
            format_percent(bytes_so_far, self.total),
        );
        if let Some(eta) = self.window.eta(bytes_so_far, self.total) {
            info.push_str(&format!(", ETA {}", format_duration(eta)));
        }
        self.reporter
            .set_line(self.mirror_msg_id, LINE_INFO, &info)
            .await;
    }
}
