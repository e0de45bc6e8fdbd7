//! Agent entry point.
//!
//! Parses flags, loads configuration, wires the container, then runs two
//! long-lived tasks: the scheduler loop and the chat event pump. Exit code
//! 0 means a clean shutdown (operator `quit` or `disabled=1` in config).

mod bootstrap;
mod spool;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vidvault_core::config::Config;
use vidvault_core::ports::{ChatEvent, ChatTransport, InboundMessage};

use crate::bootstrap::{App, bootstrap};
use crate::spool::SpoolTransport;

/// Chat-driven video download agent.
#[derive(Debug, Parser)]
#[command(name = "vidvault", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = "vidvault.conf")]
    config: PathBuf,

    /// Tracing filter (overrides RUST_LOG), e.g. "vidvault=debug".
    #[arg(long)]
    log: Option<String>,
}

/// How much history to walk per chat at startup.
const BACKFILL_LIMIT: usize = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli.log.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        EnvFilter::new,
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config)?;
    if config.disabled {
        tracing::info!("agent disabled by configuration, exiting");
        return Ok(());
    }

    let transport = Arc::new(SpoolTransport::open(&config.spool_folder)?);
    let app = bootstrap(config, transport)?;
    run(app).await
}

/// Startup backfill, then the event pump next to the scheduler loop.
async fn run(app: App) -> anyhow::Result<()> {
    app.reporter
        .service_message("agent started", Duration::from_secs(5))
        .await;

    backfill(&app).await;

    let App {
        config,
        transport,
        acquirer,
        control,
        scheduler,
        ..
    } = app;

    let mut scheduler_handle = tokio::spawn(scheduler.run());

    loop {
        let event = tokio::select! {
            // The scheduler only returns on quit; stop pumping then.
            _ = &mut scheduler_handle => break,
            event = transport.next_event() => event,
        };
        match event {
            Ok(ChatEvent::New(message)) => {
                if message.chat == config.personal_chat {
                    match control.handle_message(&message).await {
                        Ok(true) | Err(_) => {}
                        Ok(false) => {
                            tracing::debug!(id = message.id, "ignoring non-command message");
                        }
                    }
                } else if config.groups.contains_key(&message.chat) {
                    if let Err(e) = acquirer.acquire(&message, &[]).await {
                        tracing::warn!(chat = %message.chat, id = message.id, error = %e, "acquire failed");
                    }
                }
            }
            Ok(ChatEvent::Edited(message)) => {
                if message.chat == config.personal_chat {
                    control.handle_edited(&message).await;
                }
            }
            Ok(ChatEvent::Deleted { chat, ids }) => {
                if chat == config.personal_chat {
                    control.handle_deleted(&ids).await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "event fetch failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Walk recent history of every watched chat through the acquirer, so
/// artifacts posted while the agent was down still become jobs.
async fn backfill(app: &App) {
    for chat in app.config.groups.keys() {
        let messages = match app.transport.recent_messages(chat, BACKFILL_LIMIT).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(chat = %chat, error = %e, "history walk failed");
                continue;
            }
        };
        tracing::info!(chat = %chat, count = messages.len(), "walking history");

        let replies: Vec<InboundMessage> = messages
            .iter()
            .filter(|m| m.reply_to.is_some() && m.media.is_none())
            .cloned()
            .collect();

        // Oldest first, pinned jobs ahead, like the live ordering.
        let mut candidates: Vec<InboundMessage> =
            messages.into_iter().filter(|m| m.media.is_some()).collect();
        candidates.reverse();
        candidates.sort_by_key(|m| !m.pinned);

        for message in candidates {
            if let Err(e) = app.acquirer.acquire(&message, &replies).await {
                tracing::warn!(chat = %chat, id = message.id, error = %e, "acquire failed");
            }
        }
    }
}
