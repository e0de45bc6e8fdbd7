//! Spool transport: the reference `ChatTransport` adapter.
//!
//! The real chat client is an external collaborator; this adapter maps the
//! same narrow interface onto a local directory tree, which is how the
//! agent is exercised in development and end-to-end rehearsal:
//!
//! ```text
//! <spool>/<chat>/msg-<id>.json      one message per file
//! ```
//!
//! A message file references its media by path; bytes stream straight from
//! that file. Dropping a new `msg-*.json` into a chat directory is a new
//! message, rewriting one is an edit, removing one is a deletion.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use vidvault_core::errors::{EngineError, EngineResult};
use vidvault_core::job::MediaGeometry;
use vidvault_core::ports::{
    ByteStream, ChatEvent, ChatTransport, InboundMessage, MediaDocument, MediaSource,
    MessageOrigin,
};
use vidvault_core::util::sanitize::is_video_file;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// On-disk message format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SpoolMessage {
    #[serde(default)]
    text: String,
    #[serde(default)]
    media_path: Option<PathBuf>,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    forward_protected: bool,
    #[serde(default)]
    reply_to: Option<i64>,
    #[serde(default)]
    origin_chat_id: Option<i64>,
    #[serde(default)]
    origin_chat_username: Option<String>,
    #[serde(default)]
    origin_chat_title: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Default)]
struct WatchState {
    /// `(chat, id)` → last seen mtime.
    seen: HashMap<(String, i64), SystemTime>,
    pending: VecDeque<ChatEvent>,
}

/// Directory-backed transport.
pub struct SpoolTransport {
    root: PathBuf,
    next_id: Mutex<i64>,
    /// artifact id → media path, learned while scanning.
    media_index: Mutex<HashMap<i64, PathBuf>>,
    watch: tokio::sync::Mutex<WatchState>,
}

impl SpoolTransport {
    /// Open the spool root, priming the watcher so pre-existing messages
    /// are not replayed as new events (backfill reads them explicitly).
    pub fn open(root: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(root).map_err(|e| EngineError::from_io(&e))?;
        let mut max_id = 0;
        let mut seen = HashMap::new();
        for (chat, id, path) in scan_files(root)? {
            max_id = max_id.max(id);
            if let Ok(meta) = std::fs::metadata(&path) {
                seen.insert((chat, id), meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            next_id: Mutex::new(max_id + 1),
            media_index: Mutex::new(HashMap::new()),
            watch: tokio::sync::Mutex::new(WatchState {
                seen,
                pending: VecDeque::new(),
            }),
        })
    }

    fn chat_dir(&self, chat: &str) -> PathBuf {
        self.root.join(chat)
    }

    fn message_path(&self, chat: &str, id: i64) -> PathBuf {
        self.chat_dir(chat).join(format!("msg-{id}.json"))
    }

    fn alloc_id(&self) -> i64 {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    fn read_message(&self, chat: &str, id: i64) -> EngineResult<Option<InboundMessage>> {
        let path = self.message_path(chat, id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::from_io(&e)),
        };
        let raw: SpoolMessage = serde_json::from_str(&text)
            .map_err(|e| EngineError::other(format!("malformed spool message {id}: {e}")))?;
        Ok(Some(self.to_inbound(chat, id, raw)))
    }

    fn to_inbound(&self, chat: &str, id: i64, raw: SpoolMessage) -> InboundMessage {
        let media = raw.media_path.as_ref().and_then(|media_path| {
            let meta = std::fs::metadata(media_path).ok()?;
            let artifact_id = artifact_id_of(media_path);
            self.media_index
                .lock()
                .unwrap()
                .insert(artifact_id, media_path.clone());
            let file_name = media_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string());
            let geometry = match (raw.width, raw.height) {
                (Some(width), Some(height)) => Some(MediaGeometry { width, height }),
                _ => None,
            };
            Some(MediaDocument {
                artifact_id,
                is_video: file_name.as_deref().is_some_and(is_video_file),
                file_name,
                size_bytes: meta.len(),
                geometry,
            })
        });
        InboundMessage {
            chat: chat.to_string(),
            id,
            text: raw.text,
            pinned: raw.pinned,
            forward_protected: raw.forward_protected,
            reply_to: raw.reply_to,
            origin: MessageOrigin {
                chat_id: raw.origin_chat_id,
                chat_username: raw.origin_chat_username,
                chat_title: raw.origin_chat_title,
            },
            media,
        }
    }

    fn write_message(&self, chat: &str, id: i64, raw: &SpoolMessage) -> EngineResult<()> {
        let dir = self.chat_dir(chat);
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::from_io(&e))?;
        let path = self.message_path(chat, id);
        let json = serde_json::to_vec_pretty(raw)
            .map_err(|e| EngineError::other(format!("spool serialize: {e}")))?;
        std::fs::write(&path, json).map_err(|e| EngineError::from_io(&e))?;
        // Our own writes are not events.
        if let Ok(meta) = std::fs::metadata(&path) {
            if let Ok(mut watch) = self.watch.try_lock() {
                watch.seen.insert(
                    (chat.to_string(), id),
                    meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                );
            }
        }
        Ok(())
    }

    fn load_raw(&self, chat: &str, id: i64) -> EngineResult<SpoolMessage> {
        let path = self.message_path(chat, id);
        let text = std::fs::read_to_string(&path).map_err(|e| EngineError::from_io(&e))?;
        serde_json::from_str(&text)
            .map_err(|e| EngineError::other(format!("malformed spool message {id}: {e}")))
    }

    /// One watcher pass: diff the tree against the seen map.
    async fn poll_events(&self) -> EngineResult<()> {
        let files = scan_files(&self.root)?;
        let mut watch = self.watch.lock().await;
        let mut alive: HashMap<(String, i64), SystemTime> = HashMap::new();
        for (chat, id, path) in files {
            let mtime = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let key = (chat.clone(), id);
            let prior = watch.seen.get(&key).copied();
            match prior {
                None => {
                    if let Ok(Some(message)) = self.read_message(&chat, id) {
                        watch.pending.push_back(ChatEvent::New(message));
                    }
                }
                Some(seen) if seen < mtime => {
                    if let Ok(Some(message)) = self.read_message(&chat, id) {
                        watch.pending.push_back(ChatEvent::Edited(message));
                    }
                }
                Some(_) => {}
            }
            alive.insert(key, mtime);
        }
        let mut deleted: HashMap<String, Vec<i64>> = HashMap::new();
        for key in watch.seen.keys() {
            if !alive.contains_key(key) {
                deleted.entry(key.0.clone()).or_default().push(key.1);
            }
        }
        for (chat, ids) in deleted {
            watch.pending.push_back(ChatEvent::Deleted { chat, ids });
        }
        watch.seen = alive;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for SpoolTransport {
    async fn recent_messages(
        &self,
        chat: &str,
        limit: usize,
    ) -> EngineResult<Vec<InboundMessage>> {
        let dir = self.chat_dir(chat);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<i64> = std::fs::read_dir(&dir)
            .map_err(|e| EngineError::from_io(&e))?
            .filter_map(Result::ok)
            .filter_map(|e| message_id_of(&e.path()))
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut out = Vec::new();
        for id in ids.into_iter().take(limit) {
            if let Some(message) = self.read_message(chat, id)? {
                out.push(message);
            }
        }
        Ok(out)
    }

    async fn fetch_message(&self, chat: &str, id: i64) -> EngineResult<Option<InboundMessage>> {
        self.read_message(chat, id)
    }

    async fn send_message(&self, chat: &str, text: &str) -> EngineResult<i64> {
        let id = self.alloc_id();
        let raw = SpoolMessage {
            text: text.to_string(),
            ..SpoolMessage::default()
        };
        self.write_message(chat, id, &raw)?;
        Ok(id)
    }

    async fn mirror_media(
        &self,
        chat: &str,
        media: &MediaDocument,
        caption: &str,
    ) -> EngineResult<i64> {
        let media_path = self
            .media_index
            .lock()
            .unwrap()
            .get(&media.artifact_id)
            .cloned()
            .ok_or_else(|| EngineError::transport("unknown artifact"))?;
        let id = self.alloc_id();
        let raw = SpoolMessage {
            text: caption.to_string(),
            media_path: Some(media_path),
            width: media.geometry.map(|g| g.width),
            height: media.geometry.map(|g| g.height),
            ..SpoolMessage::default()
        };
        self.write_message(chat, id, &raw)?;
        Ok(id)
    }

    async fn edit_message(&self, chat: &str, id: i64, text: &str) -> EngineResult<()> {
        let mut raw = self.load_raw(chat, id)?;
        raw.text = text.to_string();
        self.write_message(chat, id, &raw)
    }

    async fn delete_message(&self, chat: &str, id: i64) -> EngineResult<()> {
        let path = self.message_path(chat, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.watch
                    .lock()
                    .await
                    .seen
                    .remove(&(chat.to_string(), id));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::from_io(&e)),
        }
    }

    async fn pin_message(&self, chat: &str, id: i64) -> EngineResult<()> {
        let mut raw = self.load_raw(chat, id)?;
        raw.pinned = true;
        self.write_message(chat, id, &raw)
    }

    async fn unpin_message(&self, chat: &str, id: i64) -> EngineResult<()> {
        let mut raw = self.load_raw(chat, id)?;
        raw.pinned = false;
        self.write_message(chat, id, &raw)
    }

    async fn open_stream(
        &self,
        source: &MediaSource,
        offset: u64,
        chunk_size: usize,
    ) -> EngineResult<ByteStream> {
        let message = self
            .read_message(&source.chat, source.message_id)?
            .ok_or_else(|| EngineError::transport("no message at source"))?;
        let artifact_id = message
            .media
            .ok_or_else(|| EngineError::transport("no media at source"))?
            .artifact_id;
        let media_path = self
            .media_index
            .lock()
            .unwrap()
            .get(&artifact_id)
            .cloned()
            .ok_or_else(|| EngineError::transport("unknown artifact"))?;

        let mut file = tokio::fs::File::open(&media_path)
            .await
            .map_err(|e| EngineError::from_io(&e))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| EngineError::from_io(&e))?;

        let stream = futures_util::stream::unfold(file, move |mut file| async move {
            let mut buf = vec![0u8; chunk_size];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), file))
                }
                Err(e) => Some((Err(EngineError::from_io(&e)), file)),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn next_event(&self) -> EngineResult<ChatEvent> {
        loop {
            if let Some(event) = self.watch.lock().await.pending.pop_front() {
                return Ok(event);
            }
            if let Err(e) = self.poll_events().await {
                tracing::warn!(error = %e, "spool scan failed");
            }
            if let Some(event) = self.watch.lock().await.pending.pop_front() {
                return Ok(event);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn is_premium(&self) -> bool {
        false
    }
}

/// All message files under a spool root: `(chat, id, path)`.
fn scan_files(root: &Path) -> EngineResult<Vec<(String, i64, PathBuf)>> {
    let mut out = Vec::new();
    let chats = std::fs::read_dir(root).map_err(|e| EngineError::from_io(&e))?;
    for chat_entry in chats.filter_map(Result::ok) {
        if !chat_entry.path().is_dir() {
            continue;
        }
        let chat = chat_entry.file_name().to_string_lossy().to_string();
        let Ok(messages) = std::fs::read_dir(chat_entry.path()) else {
            continue;
        };
        for entry in messages.filter_map(Result::ok) {
            let path = entry.path();
            let Some(id) = message_id_of(&path) else {
                continue;
            };
            out.push((chat.clone(), id, path));
        }
    }
    Ok(out)
}

fn message_id_of(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("msg-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Stable artifact id: FNV-1a of the media path, clamped positive.
fn artifact_id_of(path: &Path) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in path.to_string_lossy().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    #[allow(clippy::cast_possible_wrap)]
    {
        (hash & 0x7fff_ffff_ffff_ffff) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidvault_core::ports::ChatTransport as _;

    fn write_media(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn drop_message(root: &Path, chat: &str, id: i64, raw: &SpoolMessage) {
        let dir = root.join(chat);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(format!("msg-{id}.json")),
            serde_json::to_vec_pretty(raw).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn reads_dropped_messages_with_media() {
        let dir = tempfile::tempdir().unwrap();
        let media = write_media(dir.path(), "clip.mp4", b"0123456789");
        drop_message(
            dir.path(),
            "archive",
            5,
            &SpoolMessage {
                text: "Some Clip".to_string(),
                media_path: Some(media),
                ..SpoolMessage::default()
            },
        );

        let transport = SpoolTransport::open(dir.path()).unwrap();
        let message = transport.fetch_message("archive", 5).await.unwrap().unwrap();
        let media = message.media.unwrap();
        assert_eq!(media.size_bytes, 10);
        assert!(media.is_video);
        assert_eq!(media.file_name.as_deref(), Some("clip.mp4"));
    }

    #[tokio::test]
    async fn streams_from_offset() {
        use futures_util::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let media = write_media(dir.path(), "clip.mp4", b"0123456789");
        drop_message(
            dir.path(),
            "archive",
            1,
            &SpoolMessage {
                text: "t".to_string(),
                media_path: Some(media),
                ..SpoolMessage::default()
            },
        );
        let transport = SpoolTransport::open(dir.path()).unwrap();
        // Prime the media index.
        let _ = transport.fetch_message("archive", 1).await.unwrap();

        let source = MediaSource {
            chat: "archive".to_string(),
            message_id: 1,
        };
        let mut stream = transport.open_stream(&source, 4, 3).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"456789");
    }

    #[tokio::test]
    async fn send_edit_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SpoolTransport::open(dir.path()).unwrap();

        let id = transport.send_message("me", "hello").await.unwrap();
        assert_eq!(
            transport.fetch_message("me", id).await.unwrap().unwrap().text,
            "hello"
        );

        transport.edit_message("me", id, "edited").await.unwrap();
        assert_eq!(
            transport.fetch_message("me", id).await.unwrap().unwrap().text,
            "edited"
        );

        transport.delete_message("me", id).await.unwrap();
        assert!(transport.fetch_message("me", id).await.unwrap().is_none());
        // Deleting again is not an error.
        transport.delete_message("me", id).await.unwrap();
    }

    #[tokio::test]
    async fn ids_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let transport = SpoolTransport::open(dir.path()).unwrap();
            transport.send_message("me", "one").await.unwrap()
        };
        let transport = SpoolTransport::open(dir.path()).unwrap();
        let second = transport.send_message("me", "two").await.unwrap();
        assert!(second > first);
    }
}
