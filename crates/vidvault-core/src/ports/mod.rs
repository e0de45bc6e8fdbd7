//! Ports: the narrow interfaces behind which external collaborators live.
//!
//! The chat client, the transcoder, and the disk probe are all external to
//! the orchestration engine. The engine depends only on these traits; the
//! agent binary wires concrete adapters at its composition root.

mod disk;
mod transcoder;
mod transport;

pub use disk::{DiskProbe, DiskSpace, RealDisk};
pub use transcoder::{TranscodeRequest, TranscodeRun, TranscodeTick, Transcoder};
pub use transport::{
    ByteStream, ChatEvent, ChatTransport, InboundMessage, MediaDocument, MediaSource,
    MessageOrigin,
};
