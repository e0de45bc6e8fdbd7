//! Shared harness for the engine integration tests: the whole pipeline
//! wired over the in-memory transport, with a mocked disk probe.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use vidvault_core::config::Config;
use vidvault_core::errors::EngineResult;
use vidvault_core::job::JobStatus;
use vidvault_core::ports::{ChatTransport, DiskProbe, DiskSpace};
use vidvault_core::testkit::MemoryTransport;
use vidvault_engine::acquire::{AcquireOutcome, Acquirer};
use vidvault_engine::download::{DownloadEnd, Downloader, DownloaderDeps, PrepOutcome};
use vidvault_engine::ffmpeg::FfmpegTranscoder;
use vidvault_engine::postprocess::PostProcessor;
use vidvault_engine::reporter::Reporter;
use vidvault_rules::RuleEngine;
use vidvault_store::JobStore;

mockall::mock! {
    pub Disk {}
    impl DiskProbe for Disk {
        fn space(&self, path: &Path) -> EngineResult<DiskSpace>;
    }
}

pub struct Harness {
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<JobStore>,
    pub rules: Arc<Mutex<RuleEngine>>,
    pub downloader: Arc<Downloader>,
    pub acquirer: Acquirer,
    pub reporter: Arc<Reporter>,
    pub config: Arc<Config>,
    pub _root: tempfile::TempDir,
}

/// A probe with plenty of headroom.
pub fn roomy_disk() -> MockDisk {
    let mut disk = MockDisk::new();
    disk.expect_space().returning(|_| {
        Ok(DiskSpace {
            free_bytes: 800,
            total_bytes: 1000,
        })
    });
    disk
}

pub fn harness_with(disk: MockDisk, mutate: impl FnOnce(&mut Config)) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = Config::with_root(root.path());
    config.personal_chat = "me".to_string();
    config
        .groups
        .insert("archive".to_string(), "Archive".to_string());
    mutate(&mut config);
    config.ensure_folders().unwrap();
    let config = Arc::new(config);

    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(JobStore::open(&config.jobs_folder, &config.session_name).unwrap());
    let rules = Arc::new(Mutex::new(RuleEngine::load(&config.rules_folder)));
    let transport_dyn: Arc<dyn ChatTransport> = transport.clone();
    let reporter = Arc::new(Reporter::new(transport_dyn, "me"));
    let post = Arc::new(PostProcessor::new(
        Arc::new(FfmpegTranscoder),
        Arc::clone(&reporter),
        Arc::clone(&rules),
        Arc::clone(&config),
    ));
    let downloader = Arc::new(Downloader::new(DownloaderDeps {
        transport: transport.clone(),
        store: Arc::clone(&store),
        reporter: Arc::clone(&reporter),
        rules: Arc::clone(&rules),
        post,
        disk: Arc::new(disk),
        config: Arc::clone(&config),
    }));
    let acquirer = Acquirer::new(
        transport.clone(),
        Arc::clone(&store),
        Arc::clone(&rules),
        Arc::clone(&config),
    );

    Harness {
        transport,
        store,
        rules,
        downloader,
        acquirer,
        reporter,
        config,
        _root: root,
    }
}

pub fn harness() -> Harness {
    harness_with(roomy_disk(), |_| {})
}

impl Harness {
    /// Post a video into the watched chat and acquire it.
    pub async fn acquire_video(&self, title: &str, file: &str, bytes: Vec<u8>) -> i64 {
        let message = self
            .transport
            .push_video_message("archive", title, Some(file), bytes);
        match self.acquirer.acquire(&message, &[]).await.unwrap() {
            AcquireOutcome::Created(mirror) => mirror,
            AcquireOutcome::Skipped => panic!("acquisition skipped"),
        }
    }

    pub async fn run_job(&self, mirror: i64) -> DownloadEnd {
        let job = self.store.get_by_mirror(mirror).unwrap().unwrap();
        let job = match self.downloader.prep(job).await.unwrap() {
            PrepOutcome::Ready(job) => *job,
            PrepOutcome::Skip => panic!("prep skipped"),
        };
        self.downloader.run(job, CancellationToken::new()).await
    }

    pub async fn badge(&self, mirror: i64) -> Option<JobStatus> {
        self.reporter.board(mirror).await.unwrap().unwrap().status()
    }
}
