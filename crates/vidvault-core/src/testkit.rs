//! In-memory chat transport with scripted faults.
//!
//! Only compiled with the `test-utils` feature; sibling crates use it to
//! drive the pipeline end-to-end without a chat client. Faults are queued
//! per artifact and consumed one per `open_stream`, which is how tests
//! simulate flood waits, connection drops, and transport errors.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::errors::{EngineError, EngineResult};
use crate::job::MediaGeometry;
use crate::ports::{
    ByteStream, ChatEvent, ChatTransport, InboundMessage, MediaDocument, MediaSource,
    MessageOrigin,
};

/// One scripted behavior for the next `open_stream` of an artifact.
#[derive(Debug, Clone)]
pub enum StreamFault {
    /// The stream's first item is a flood-wait error.
    FloodWait(u64),
    /// The stream ends after delivering this many bytes.
    Interrupt { after_bytes: u64 },
    /// The stream's first item is a transient transport error.
    Error(String),
}

struct MediaBlob {
    bytes: Arc<Vec<u8>>,
    faults: VecDeque<StreamFault>,
}

#[derive(Default)]
struct State {
    chats: HashMap<String, BTreeMap<i64, InboundMessage>>,
    media: HashMap<i64, MediaBlob>,
    next_msg_id: i64,
    next_artifact_id: i64,
    active_streams: usize,
    peak_streams: usize,
    stream_opens: Vec<(i64, u64)>,
}

/// Scripted in-memory transport.
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    premium: bool,
    events_tx: mpsc::UnboundedSender<ChatEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChatEvent>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(State {
                next_msg_id: 1,
                next_artifact_id: 1000,
                ..State::default()
            })),
            premium: false,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    #[must_use]
    pub fn premium(mut self) -> Self {
        self.premium = true;
        self
    }

    /// Post a video message into a chat; returns the stored message.
    pub fn push_video_message(
        &self,
        chat: &str,
        text: &str,
        file_name: Option<&str>,
        bytes: Vec<u8>,
    ) -> InboundMessage {
        let mut state = self.state.lock().unwrap();
        let msg_id = state.next_msg_id;
        state.next_msg_id += 1;
        let artifact_id = state.next_artifact_id;
        state.next_artifact_id += 1;

        let media = MediaDocument {
            artifact_id,
            file_name: file_name.map(str::to_string),
            size_bytes: bytes.len() as u64,
            geometry: Some(MediaGeometry {
                width: 1280,
                height: 720,
            }),
            is_video: true,
        };
        state.media.insert(
            artifact_id,
            MediaBlob {
                bytes: Arc::new(bytes),
                faults: VecDeque::new(),
            },
        );

        let message = InboundMessage {
            chat: chat.to_string(),
            id: msg_id,
            text: text.to_string(),
            pinned: false,
            forward_protected: false,
            reply_to: None,
            origin: MessageOrigin::default(),
            media: Some(media),
        };
        state
            .chats
            .entry(chat.to_string())
            .or_default()
            .insert(msg_id, message.clone());
        drop(state);
        let _ = self.events_tx.send(ChatEvent::New(message.clone()));
        message
    }

    /// Post a plain text message (optionally a reply) into a chat.
    pub fn push_text_message(&self, chat: &str, text: &str, reply_to: Option<i64>) -> InboundMessage {
        let mut state = self.state.lock().unwrap();
        let msg_id = state.next_msg_id;
        state.next_msg_id += 1;
        let message = InboundMessage {
            chat: chat.to_string(),
            id: msg_id,
            text: text.to_string(),
            pinned: false,
            forward_protected: false,
            reply_to,
            origin: MessageOrigin::default(),
            media: None,
        };
        state
            .chats
            .entry(chat.to_string())
            .or_default()
            .insert(msg_id, message.clone());
        drop(state);
        let _ = self.events_tx.send(ChatEvent::New(message.clone()));
        message
    }

    /// Queue a fault for the next `open_stream` of `artifact_id`.
    pub fn script_fault(&self, artifact_id: i64, fault: StreamFault) {
        let mut state = self.state.lock().unwrap();
        state
            .media
            .get_mut(&artifact_id)
            .expect("unknown artifact")
            .faults
            .push_back(fault);
    }

    /// Mark a message forward-protected.
    pub fn protect_message(&self, chat: &str, id: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.chats.get_mut(chat).and_then(|c| c.get_mut(&id)) {
            msg.forward_protected = true;
        }
    }

    /// Current copy of a message.
    #[must_use]
    pub fn message(&self, chat: &str, id: i64) -> Option<InboundMessage> {
        self.state
            .lock()
            .unwrap()
            .chats
            .get(chat)
            .and_then(|c| c.get(&id))
            .cloned()
    }

    /// All messages of a chat, ascending id.
    #[must_use]
    pub fn messages(&self, chat: &str) -> Vec<InboundMessage> {
        self.state
            .lock()
            .unwrap()
            .chats
            .get(chat)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest number of concurrently open streams observed.
    #[must_use]
    pub fn peak_streams(&self) -> usize {
        self.state.lock().unwrap().peak_streams
    }

    /// `(artifact_id, offset)` of every `open_stream` call, in order.
    #[must_use]
    pub fn stream_opens(&self) -> Vec<(i64, u64)> {
        self.state.lock().unwrap().stream_opens.clone()
    }
}

/// Decrements the active-stream gauge when the stream is dropped.
struct StreamGuard {
    state: Arc<Mutex<State>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.lock().unwrap().active_streams -= 1;
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn recent_messages(
        &self,
        chat: &str,
        limit: usize,
    ) -> EngineResult<Vec<InboundMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .chats
            .get(chat)
            .map(|c| c.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_message(&self, chat: &str, id: i64) -> EngineResult<Option<InboundMessage>> {
        Ok(self.message(chat, id))
    }

    async fn send_message(&self, chat: &str, text: &str) -> EngineResult<i64> {
        let mut state = self.state.lock().unwrap();
        let msg_id = state.next_msg_id;
        state.next_msg_id += 1;
        let message = InboundMessage {
            chat: chat.to_string(),
            id: msg_id,
            text: text.to_string(),
            pinned: false,
            forward_protected: false,
            reply_to: None,
            origin: MessageOrigin::default(),
            media: None,
        };
        state
            .chats
            .entry(chat.to_string())
            .or_default()
            .insert(msg_id, message);
        Ok(msg_id)
    }

    async fn mirror_media(
        &self,
        chat: &str,
        media: &MediaDocument,
        caption: &str,
    ) -> EngineResult<i64> {
        let mut state = self.state.lock().unwrap();
        if !state.media.contains_key(&media.artifact_id) {
            return Err(EngineError::transport("unknown artifact"));
        }
        let msg_id = state.next_msg_id;
        state.next_msg_id += 1;
        let message = InboundMessage {
            chat: chat.to_string(),
            id: msg_id,
            text: caption.to_string(),
            pinned: false,
            forward_protected: false,
            reply_to: None,
            origin: MessageOrigin::default(),
            media: Some(media.clone()),
        };
        state
            .chats
            .entry(chat.to_string())
            .or_default()
            .insert(msg_id, message);
        Ok(msg_id)
    }

    async fn edit_message(&self, chat: &str, id: i64, text: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let message = state
            .chats
            .get_mut(chat)
            .and_then(|c| c.get_mut(&id))
            .ok_or_else(|| EngineError::transport("message not found"))?;
        message.text = text.to_string();
        Ok(())
    }

    async fn delete_message(&self, chat: &str, id: i64) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(messages) = state.chats.get_mut(chat) {
            messages.remove(&id);
        }
        Ok(())
    }

    async fn pin_message(&self, chat: &str, id: i64) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.chats.get_mut(chat).and_then(|c| c.get_mut(&id)) {
            msg.pinned = true;
        }
        Ok(())
    }

    async fn unpin_message(&self, chat: &str, id: i64) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.chats.get_mut(chat).and_then(|c| c.get_mut(&id)) {
            msg.pinned = false;
        }
        Ok(())
    }

    async fn open_stream(
        &self,
        source: &MediaSource,
        offset: u64,
        chunk_size: usize,
    ) -> EngineResult<ByteStream> {
        let (bytes, fault) = {
            let mut state = self.state.lock().unwrap();
            let artifact_id = state
                .chats
                .get(&source.chat)
                .and_then(|c| c.get(&source.message_id))
                .and_then(|m| m.media.as_ref())
                .map(|m| m.artifact_id)
                .ok_or_else(|| EngineError::transport("no media at source"))?;
            let blob = state
                .media
                .get_mut(&artifact_id)
                .ok_or_else(|| EngineError::transport("unknown artifact"))?;
            let bytes = Arc::clone(&blob.bytes);
            let fault = blob.faults.pop_front();

            state.stream_opens.push((artifact_id, offset));
            state.active_streams += 1;
            state.peak_streams = state.peak_streams.max(state.active_streams);
            (bytes, fault)
        };

        let guard = StreamGuard {
            state: Arc::clone(&self.state),
        };

        let mut items: Vec<EngineResult<Bytes>> = Vec::new();
        match fault {
            Some(StreamFault::FloodWait(seconds)) => {
                items.push(Err(EngineError::FloodWait { seconds }));
            }
            Some(StreamFault::Error(message)) => {
                items.push(Err(EngineError::Transport { message }));
            }
            Some(StreamFault::Interrupt { after_bytes }) => {
                push_chunks(&mut items, &bytes, offset, chunk_size, Some(after_bytes));
            }
            None => {
                push_chunks(&mut items, &bytes, offset, chunk_size, None);
            }
        }

        let stream = futures_util::stream::iter(items).map(move |item| {
            let _held = &guard;
            item
        });
        Ok(Box::pin(stream))
    }

    async fn next_event(&self) -> EngineResult<ChatEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| EngineError::transport("event channel closed"))
    }

    fn is_premium(&self) -> bool {
        self.premium
    }
}

fn push_chunks(
    items: &mut Vec<EngineResult<Bytes>>,
    bytes: &[u8],
    offset: u64,
    chunk_size: usize,
    limit: Option<u64>,
) {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
    let mut remaining = limit.map_or(bytes.len() - start, |l| {
        usize::try_from(l).unwrap_or(usize::MAX).min(bytes.len() - start)
    });
    let mut cursor = start;
    while remaining > 0 {
        let take = chunk_size.min(remaining);
        items.push(Ok(Bytes::copy_from_slice(&bytes[cursor..cursor + take])));
        cursor += take;
        remaining -= take;
    }
}
