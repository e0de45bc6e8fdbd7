//! Download orchestration engine.
//!
//! The pipeline end to end: the [`acquire::Acquirer`] turns inbound media
//! messages into persisted jobs, the [`scheduler::Scheduler`] drives a
//! bounded-parallel wave of [`download::Downloader`] workers every tick,
//! the [`reporter::Reporter`] keeps each job's mirror message current, and
//! the [`postprocess::PostProcessor`] transcodes and places finished files.
//! The [`control::ControlPlane`] exposes all of it over the operator chat.

pub mod acquire;
pub mod control;
pub mod download;
pub mod ffmpeg;
pub mod postprocess;
pub mod progress;
pub mod reporter;
pub mod scheduler;

pub use acquire::{AcquireOutcome, Acquirer};
pub use control::ControlPlane;
pub use download::{
    DownloadEnd, Downloader, DownloaderDeps, PrepOutcome, RETRY_ATTEMPTS, StreamOutcome,
    chunk_delay, request_chunk_size,
};
pub use ffmpeg::FfmpegTranscoder;
pub use postprocess::{PostProcessor, STAGNANT_POLL_LIMIT, compression_factor, estimated_output_bytes};
pub use progress::{ProgressThrottle, REPORT_INTERVAL, SpeedWindow};
pub use reporter::{ProgressSink, Reporter};
pub use scheduler::{ControlCommand, Scheduler, TICK_INTERVAL};

// Silence unused dev-dependency warnings until we add mock-based tests
#[cfg(test)]
use mockall as _;
#[cfg(test)]
use tokio_test as _;
