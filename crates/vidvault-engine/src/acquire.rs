//! Acquirer: turns an inbound media message into a persisted job.
//!
//! Acquisition is idempotent twice over: captions already bearing a badge
//! glyph are messages the agent itself produced, and an artifact id already
//! in the store means the job exists. Feeding the same source message any
//! number of times yields exactly one job and one mirror message.

use std::sync::{Arc, Mutex};

use vidvault_core::board::ProgressBoard;
use vidvault_core::config::Config;
use vidvault_core::errors::EngineResult;
use vidvault_core::job::{JobRecord, JobStatus};
use vidvault_core::ports::{ChatTransport, InboundMessage, MediaDocument};
use vidvault_core::util::sanitize::{
    file_stem, is_video_file, sanitize_display_name, sanitize_filename, strip_markdown,
};
use vidvault_rules::{RuleContext, RuleEngine};
use vidvault_store::JobStore;

/// What `acquire` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A new job was persisted and mirrored.
    Created(i64),
    /// Not a video, already mirrored, already known, or unusable name.
    Skipped,
}

/// Media-message intake.
pub struct Acquirer {
    transport: Arc<dyn ChatTransport>,
    store: Arc<JobStore>,
    rules: Arc<Mutex<RuleEngine>>,
    config: Arc<Config>,
}

impl Acquirer {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<JobStore>,
        rules: Arc<Mutex<RuleEngine>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            transport,
            store,
            rules,
            config,
        }
    }

    /// Process one observed message. `replies` are candidate title sources:
    /// messages replying to `message` in the same chat.
    pub async fn acquire(
        &self,
        message: &InboundMessage,
        replies: &[InboundMessage],
    ) -> EngineResult<AcquireOutcome> {
        let Some(media) = message.media.as_ref().filter(|m| is_video(m)) else {
            return Ok(AcquireOutcome::Skipped);
        };

        // A caption with a badge glyph is one of our own mirror messages.
        if JobStatus::text_bears_badge(&message.text) {
            return Ok(AcquireOutcome::Skipped);
        }

        let Some((original_name, used_reply)) = self.candidate_name(message, media, replies)
        else {
            tracing::debug!(chat = %message.chat, id = message.id, "no usable title, skipping");
            return Ok(AcquireOutcome::Skipped);
        };

        let file_name = media
            .file_name
            .as_deref()
            .map(sanitize_filename)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{}.mp4", sanitize_filename(&original_name)));

        if self.store.get_by_artifact(media.artifact_id).map_err(store_err)?.is_some() {
            tracing::debug!(artifact = media.artifact_id, "already acquired");
            return Ok(AcquireOutcome::Skipped);
        }

        let display_name = {
            let mut rules = self.rules.lock().unwrap();
            let ctx = RuleContext {
                chat_id: message.origin.chat_id,
                chat_username: message.origin.chat_username.as_deref(),
                chat_title: message.origin.chat_title.as_deref(),
                file_name: &file_name,
                artifact_id: media.artifact_id,
            };
            rules
                .apply_translate(&original_name, &ctx)
                .unwrap_or_else(|| original_name.clone())
        };

        let mut record = JobRecord {
            mirror_msg_id: 0,
            source_chat: message.chat.clone(),
            source_msg_id: message.id,
            forward_protected: message.forward_protected,
            artifact_id: media.artifact_id,
            display_name,
            original_name,
            staging_path: self.config.download_folder.join(&file_name),
            file_name,
            target_folder: self.config.completed_folder.clone(),
            geometry: media.geometry,
            pinned: message.pinned,
            completed: false,
            size_bytes: media.size_bytes,
            origin_chat_id: message.origin.chat_id,
            origin_chat_username: message.origin.chat_username.clone(),
            origin_chat_title: message.origin.chat_title.clone(),
            extra: serde_json::Map::new(),
        };

        self.post_mirror(&mut record, media).await?;
        self.store.upsert(&record).map_err(store_err)?;

        if let Some(reply_id) = used_reply {
            let _ = self.transport.delete_message(&message.chat, reply_id).await;
        }
        if !record.forward_protected {
            self.transport
                .delete_message(&message.chat, message.id)
                .await?;
        }

        tracing::info!(
            artifact = record.artifact_id,
            mirror = record.mirror_msg_id,
            name = %record.display_name,
            chat = %record.source_chat,
            "job acquired"
        );
        Ok(AcquireOutcome::Created(record.mirror_msg_id))
    }

    /// Extract the display-name candidate and the reply message it came
    /// from (which gets deleted once consumed).
    fn candidate_name(
        &self,
        message: &InboundMessage,
        media: &MediaDocument,
        replies: &[InboundMessage],
    ) -> Option<(String, Option<i64>)> {
        for reply in replies {
            if reply.reply_to != Some(message.id) {
                continue;
            }
            let first = reply.first_line();
            if first.is_empty() || JobStatus::text_bears_badge(first) {
                continue;
            }
            let name = sanitize_display_name(&strip_markdown(first));
            if !name.is_empty() {
                return Some((name, Some(reply.id)));
            }
        }

        let joined = message
            .text
            .lines()
            .take(3)
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let name = sanitize_display_name(&strip_markdown(&joined));
        if !name.is_empty() {
            return Some((name, None));
        }

        let stem = media.file_name.as_deref().map(file_stem).unwrap_or_default();
        if stem.is_empty() {
            None
        } else {
            Some((stem, None))
        }
    }

    /// Post the mirror message: a media copy when forwarding is allowed,
    /// otherwise a text-only caption. A failed copy downgrades the job to
    /// forward-protected so the bytes stay fetchable from the source.
    async fn post_mirror(
        &self,
        record: &mut JobRecord,
        media: &MediaDocument,
    ) -> EngineResult<()> {
        let caption = ProgressBoard::for_job(record).render();
        let chat = &self.config.personal_chat;
        if !record.forward_protected {
            match self.transport.mirror_media(chat, media, &caption).await {
                Ok(id) => {
                    record.mirror_msg_id = id;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "media mirror failed, falling back to text caption");
                    record.forward_protected = true;
                }
            }
        }
        record.mirror_msg_id = self.transport.send_message(chat, &caption).await?;
        Ok(())
    }
}

fn is_video(media: &MediaDocument) -> bool {
    media.is_video || media.file_name.as_deref().is_some_and(is_video_file)
}

fn store_err(err: vidvault_store::StoreError) -> vidvault_core::errors::EngineError {
    vidvault_core::errors::EngineError::other(err.to_string())
}
