//! Chat transport port.
//!
//! Everything the pipeline needs from the chat client: message fetch, send,
//! edit, delete, pin, and a resumable byte stream for media. No client
//! library types leak through; the engine sees only these DTOs.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::errors::EngineResult;
use crate::job::MediaGeometry;

/// A chunked media byte stream. Chunks arrive in order from the requested
/// offset; the transport may deliver smaller chunks than asked for.
pub type ByteStream = Pin<Box<dyn Stream<Item = EngineResult<Bytes>> + Send>>;

/// Where the forwarding channel got the message from, for rule scoping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOrigin {
    pub chat_id: Option<i64>,
    pub chat_username: Option<String>,
    pub chat_title: Option<String>,
}

/// The media document attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDocument {
    /// Stable id of the remote artifact.
    pub artifact_id: i64,
    /// Filename from the document attributes, when present.
    pub file_name: Option<String>,
    /// Authoritative size in bytes.
    pub size_bytes: u64,
    /// Video geometry, when the document carries a video attribute.
    pub geometry: Option<MediaGeometry>,
    /// Whether the document carries a video attribute.
    pub is_video: bool,
}

/// One message as observed in a watched chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Friendly key of the chat (config `[groups]` key or the operator chat).
    pub chat: String,
    pub id: i64,
    pub text: String,
    pub pinned: bool,
    /// The source chat forbids forwarding its media.
    pub forward_protected: bool,
    /// Id of the message this one replies to, if any.
    pub reply_to: Option<i64>,
    pub origin: MessageOrigin,
    pub media: Option<MediaDocument>,
}

impl InboundMessage {
    /// First line of the text, trimmed.
    #[must_use]
    pub fn first_line(&self) -> &str {
        self.text.lines().next().unwrap_or("").trim()
    }
}

/// Pointer to the message whose media should be streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub chat: String,
    pub message_id: i64,
}

/// Chat-side events the agent consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    New(InboundMessage),
    Edited(InboundMessage),
    Deleted { chat: String, ids: Vec<i64> },
}

/// The transport client, as seen by the engine.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Most recent messages of a chat, newest first, up to `limit`.
    async fn recent_messages(
        &self,
        chat: &str,
        limit: usize,
    ) -> EngineResult<Vec<InboundMessage>>;

    /// Fetch a single message; `None` when it no longer exists.
    async fn fetch_message(&self, chat: &str, id: i64) -> EngineResult<Option<InboundMessage>>;

    /// Send a text message, returning its id.
    async fn send_message(&self, chat: &str, text: &str) -> EngineResult<i64>;

    /// Copy a media document into `chat` with a caption, returning the new
    /// message id. Fails with a transport error when the source chat is
    /// forward-protected; callers fall back to [`Self::send_message`].
    async fn mirror_media(
        &self,
        chat: &str,
        media: &MediaDocument,
        caption: &str,
    ) -> EngineResult<i64>;

    /// Replace a message's text.
    async fn edit_message(&self, chat: &str, id: i64, text: &str) -> EngineResult<()>;

    /// Delete a message. Deleting an already-gone message is not an error.
    async fn delete_message(&self, chat: &str, id: i64) -> EngineResult<()>;

    /// Pin a message in the chat.
    async fn pin_message(&self, chat: &str, id: i64) -> EngineResult<()>;

    /// Unpin a message.
    async fn unpin_message(&self, chat: &str, id: i64) -> EngineResult<()>;

    /// Open a byte stream over the media of `source`, starting at `offset`.
    async fn open_stream(
        &self,
        source: &MediaSource,
        offset: u64,
        chunk_size: usize,
    ) -> EngineResult<ByteStream>;

    /// Next chat-side event; long-polls until one is available.
    async fn next_event(&self) -> EngineResult<ChatEvent>;

    /// Operator entitlement, used for chunk sizing.
    fn is_premium(&self) -> bool;
}
