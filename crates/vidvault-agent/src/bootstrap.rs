//! Composition root.
//!
//! This is the ONLY place where infrastructure is wired together: one plain
//! struct of handles, built once at startup and passed explicitly. There
//! are no globals; the shutdown signal travels through the scheduler's
//! command channel.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use vidvault_core::config::Config;
use vidvault_core::ports::{ChatTransport, RealDisk};
use vidvault_engine::acquire::Acquirer;
use vidvault_engine::control::ControlPlane;
use vidvault_engine::download::{Downloader, DownloaderDeps};
use vidvault_engine::ffmpeg::FfmpegTranscoder;
use vidvault_engine::postprocess::PostProcessor;
use vidvault_engine::reporter::Reporter;
use vidvault_engine::scheduler::{ControlCommand, Scheduler};
use vidvault_rules::RuleEngine;
use vidvault_store::JobStore;

/// The application container: every component, one handle each.
pub struct App {
    pub config: Arc<Config>,
    pub transport: Arc<dyn ChatTransport>,
    pub store: Arc<JobStore>,
    pub rules: Arc<Mutex<RuleEngine>>,
    pub reporter: Arc<Reporter>,
    pub acquirer: Arc<Acquirer>,
    pub control: Arc<ControlPlane>,
    pub scheduler: Scheduler,
    pub scheduler_tx: mpsc::Sender<ControlCommand>,
}

/// Wire the pipeline around a transport.
pub fn bootstrap(config: Config, transport: Arc<dyn ChatTransport>) -> anyhow::Result<App> {
    config.ensure_folders()?;
    let config = Arc::new(config);

    let store = Arc::new(JobStore::open(&config.jobs_folder, &config.session_name)?);
    let rules = Arc::new(Mutex::new(RuleEngine::load(&config.rules_folder)));
    let reporter = Arc::new(Reporter::new(
        Arc::clone(&transport),
        config.personal_chat.clone(),
    ));

    let post = Arc::new(PostProcessor::new(
        Arc::new(FfmpegTranscoder),
        Arc::clone(&reporter),
        Arc::clone(&rules),
        Arc::clone(&config),
    ));
    let downloader = Arc::new(Downloader::new(DownloaderDeps {
        transport: Arc::clone(&transport),
        store: Arc::clone(&store),
        reporter: Arc::clone(&reporter),
        rules: Arc::clone(&rules),
        post,
        disk: Arc::new(RealDisk),
        config: Arc::clone(&config),
    }));

    let (scheduler, scheduler_tx) = Scheduler::new(
        downloader,
        Arc::clone(&store),
        Arc::clone(&reporter),
        Arc::clone(&config),
    );

    let acquirer = Arc::new(Acquirer::new(
        Arc::clone(&transport),
        Arc::clone(&store),
        Arc::clone(&rules),
        Arc::clone(&config),
    ));
    let control = Arc::new(ControlPlane::new(
        Arc::clone(&transport),
        Arc::clone(&store),
        Arc::clone(&rules),
        Arc::clone(&reporter),
        Arc::clone(&config),
        scheduler_tx.clone(),
    ));

    Ok(App {
        config,
        transport,
        store,
        rules,
        reporter,
        acquirer,
        control,
        scheduler,
        scheduler_tx,
    })
}
