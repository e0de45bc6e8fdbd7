//! Scheduler: the single driver loop.
//!
//! Every tick it loads pending jobs, stable-sorts them (pinned first, then
//! ascending artifact id), preps each, and launches workers behind one
//! counting semaphore. Control arrives over an mpsc channel and lands in
//! private flags; workers only ever see a cancellation token.
//!
//! At-most-once concurrent run per job holds structurally: a tick does not
//! end until its whole wave has joined, so no job can be re-submitted while
//! a worker still holds it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use vidvault_core::config::Config;
use vidvault_store::JobStore;

use crate::download::{DownloadEnd, Downloader, PrepOutcome};
use crate::reporter::Reporter;

/// Gap between scheduler passes.
pub const TICK_INTERVAL: Duration = Duration::from_secs(3);

/// Lifetime of scheduler announcements in the operator chat.
const ANNOUNCE_TTL: Duration = Duration::from_secs(30);

/// Operator-facing control commands, delivered over the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// `download:on` - resume launching workers.
    StartDownloads,
    /// `download:off` - stop launching and interrupt running workers.
    StopDownloads,
    /// `quit` - exit after the current wave drains.
    Quit,
}

/// Private run state; only the driver loop writes it.
#[derive(Debug, Clone, Copy)]
struct RunFlags {
    start_download: bool,
    interrupt: bool,
    quit: bool,
}

/// The driver loop.
pub struct Scheduler {
    downloader: Arc<Downloader>,
    store: Arc<JobStore>,
    reporter: Arc<Reporter>,
    config: Arc<Config>,
    commands: mpsc::Receiver<ControlCommand>,
}

impl Scheduler {
    /// Build the scheduler and its command-channel sender.
    #[must_use]
    pub fn new(
        downloader: Arc<Downloader>,
        store: Arc<JobStore>,
        reporter: Arc<Reporter>,
        config: Arc<Config>,
    ) -> (Self, mpsc::Sender<ControlCommand>) {
        let (tx, commands) = mpsc::channel(16);
        (
            Self {
                downloader,
                store,
                reporter,
                config,
                commands,
            },
            tx,
        )
    }

    /// Run until `Quit` (or every command sender is dropped).
    pub async fn run(mut self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_simultaneous_downloads));
        let mut flags = RunFlags {
            start_download: true,
            interrupt: false,
            quit: false,
        };
        let mut cancel = CancellationToken::new();

        tracing::info!(
            max_concurrent = self.config.max_simultaneous_downloads,
            "scheduler started"
        );

        loop {
            while let Ok(command) = self.commands.try_recv() {
                apply_command(command, &mut flags, &cancel);
            }
            if flags.quit {
                break;
            }

            if flags.start_download {
                // A fresh token per wave; an interrupt burns the old one.
                if cancel.is_cancelled() {
                    cancel = CancellationToken::new();
                }
                flags.interrupt = false;
                let did_work = self.tick(&semaphore, &mut flags, &cancel).await;
                if flags.quit {
                    break;
                }
                if did_work && self.config.lock_download {
                    flags.start_download = false;
                    self.reporter
                        .service_message("download_stopped", ANNOUNCE_TTL)
                        .await;
                }
            }

            tokio::select! {
                () = tokio::time::sleep(TICK_INTERVAL) => {}
                command = self.commands.recv() => match command {
                    Some(command) => apply_command(command, &mut flags, &cancel),
                    None => flags.quit = true,
                },
            }
        }

        tracing::info!("scheduler stopped");
    }

    /// One pass: launch eligible jobs, then aggregate the wave while still
    /// servicing control commands. Returns whether any worker ran.
    async fn tick(
        &mut self,
        semaphore: &Arc<Semaphore>,
        flags: &mut RunFlags,
        cancel: &CancellationToken,
    ) -> bool {
        let mut jobs = match self.store.list_pending() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "job scan failed, skipping tick");
                return false;
            }
        };
        jobs.sort_by_key(vidvault_core::job::JobRecord::schedule_key);

        let mut wave: JoinSet<(i64, DownloadEnd)> = JoinSet::new();
        let mut running: HashSet<i64> = HashSet::new();

        for job in jobs {
            if job.completed || running.contains(&job.artifact_id) {
                continue;
            }
            let prepped = match self.downloader.prep(job).await {
                Ok(PrepOutcome::Ready(job)) => *job,
                Ok(PrepOutcome::Skip) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "prep failed, job skipped this tick");
                    continue;
                }
            };

            running.insert(prepped.artifact_id);
            let downloader = Arc::clone(&self.downloader);
            let semaphore = Arc::clone(semaphore);
            let token = cancel.child_token();
            let artifact_id = prepped.artifact_id;
            wave.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (artifact_id, DownloadEnd::Cancelled);
                };
                if token.is_cancelled() {
                    return (artifact_id, DownloadEnd::Cancelled);
                }
                (artifact_id, downloader.run(prepped, token).await)
            });
        }

        let launched = !wave.is_empty();
        if launched {
            tracing::debug!(count = wave.len(), "wave launched");
        }

        loop {
            tokio::select! {
                joined = wave.join_next() => match joined {
                    None => break,
                    Some(Ok((artifact_id, end))) => {
                        running.remove(&artifact_id);
                        tracing::debug!(artifact = artifact_id, end = ?end, "worker finished");
                        if end == DownloadEnd::DiskFull {
                            flags.start_download = false;
                            flags.interrupt = true;
                            cancel.cancel();
                            self.reporter
                                .service_message(
                                    "disk space limit reached, downloads stopped",
                                    ANNOUNCE_TTL,
                                )
                                .await;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "worker panicked");
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => apply_command(command, flags, cancel),
                    None => {
                        flags.quit = true;
                        cancel.cancel();
                    }
                },
            }
        }

        launched
    }
}

fn apply_command(command: ControlCommand, flags: &mut RunFlags, cancel: &CancellationToken) {
    tracing::info!(command = ?command, "control command");
    match command {
        ControlCommand::StartDownloads => {
            flags.start_download = true;
            flags.interrupt = false;
        }
        ControlCommand::StopDownloads => {
            flags.start_download = false;
            flags.interrupt = true;
            cancel.cancel();
        }
        ControlCommand::Quit => {
            flags.quit = true;
            cancel.cancel();
        }
    }
}
