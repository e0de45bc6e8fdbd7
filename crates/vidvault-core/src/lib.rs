//! Core domain for the vidvault download agent.
//!
//! Pure types and narrow ports: jobs and their board, the error taxonomy,
//! configuration, and the transport/transcoder/disk interfaces the engine
//! orchestrates behind. No chat client and no scheduler live here.

pub mod board;
pub mod config;
pub mod errors;
pub mod job;
pub mod ports;
pub mod util;

#[cfg(feature = "test-utils")]
pub mod testkit;

// Re-export commonly used types for convenience
pub use board::{
    LINE_FILE_NAME, LINE_FILE_SIZE, LINE_GEOMETRY, LINE_INFO, LINE_LAST_ERROR, LINE_PINNED,
    LINE_STATUS, LINE_TARGET_FOLDER, LINE_VIDEO_NAME, ProgressBoard,
};
pub use config::{Config, ConfigError};
pub use errors::{EngineError, EngineResult};
pub use job::{JobPatch, JobRecord, JobStatus, MediaGeometry};
pub use ports::{
    ByteStream, ChatEvent, ChatTransport, DiskProbe, DiskSpace, InboundMessage, MediaDocument,
    MediaSource, MessageOrigin, RealDisk, TranscodeRequest, TranscodeRun, TranscodeTick,
    Transcoder,
};

// Silence unused dev-dependency warnings until we add mock-based tests
#[cfg(test)]
use mockall as _;
#[cfg(test)]
use tokio_test as _;
