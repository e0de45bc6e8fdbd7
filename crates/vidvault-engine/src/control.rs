//! Control plane: operator commands over the command-and-status chat.
//!
//! Commands are a table lookup from the first token of a message to a
//! handler. Reply-scoped commands resolve the replied-to mirror message to
//! its job. Rule management posts rule files into the chat and reacts to
//! edits/deletions of those posted messages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use vidvault_core::board::{LINE_PINNED, LINE_TARGET_FOLDER, LINE_VIDEO_NAME};
use vidvault_core::config::Config;
use vidvault_core::errors::EngineResult;
use vidvault_core::job::{JobPatch, JobRecord, JobStatus};
use vidvault_core::ports::{ChatTransport, InboundMessage};
use vidvault_core::util::sanitize::sanitize_display_name;
use vidvault_rules::RuleEngine;
use vidvault_store::JobStore;

use crate::reporter::Reporter;
use crate::scheduler::ControlCommand;

const SERVICE_TTL: Duration = Duration::from_secs(30);
const HELP_TTL: Duration = Duration::from_secs(120);

/// What a trigger does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Help,
    Quit,
    Status,
    DownloadOn,
    DownloadOff,
    DownloadClean,
    DownloadCount,
    Rename,
    SetTarget,
    Pin,
    Unpin,
    Info,
    RulesShow,
    RulesAdd,
    RulesEdit,
    RulesDelete,
    RulesReload,
}

struct CommandSpec {
    triggers: &'static [&'static str],
    kind: CommandKind,
    description: &'static str,
    needs_reply: bool,
}

/// The command table. First-token lookup, aliases included.
static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        triggers: &["help", "command", "commands"],
        kind: CommandKind::Help,
        description: "list commands",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["quit"],
        kind: CommandKind::Quit,
        description: "stop the agent",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["status"],
        kind: CommandKind::Status,
        description: "show the active configuration",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["download:on", "download:start", "dl:on", "dl:start"],
        kind: CommandKind::DownloadOn,
        description: "resume downloads",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["download:off", "download:stop", "dl:off", "dl:stop"],
        kind: CommandKind::DownloadOff,
        description: "stop downloads and interrupt workers",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["download:clean"],
        kind: CommandKind::DownloadClean,
        description: "delete completed mirror messages",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["download:count"],
        kind: CommandKind::DownloadCount,
        description: "count jobs per status",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["download:rename", "dl:rn", "rename"],
        kind: CommandKind::Rename,
        description: "rename the replied job",
        needs_reply: true,
    },
    CommandSpec {
        triggers: &["download:settarget"],
        kind: CommandKind::SetTarget,
        description: "set the replied job's target folder",
        needs_reply: true,
    },
    CommandSpec {
        triggers: &["download:pin"],
        kind: CommandKind::Pin,
        description: "pin the replied job",
        needs_reply: true,
    },
    CommandSpec {
        triggers: &["download:unpin"],
        kind: CommandKind::Unpin,
        description: "unpin the replied job",
        needs_reply: true,
    },
    CommandSpec {
        triggers: &["download:info"],
        kind: CommandKind::Info,
        description: "show the replied job's record",
        needs_reply: true,
    },
    CommandSpec {
        triggers: &["rules:show"],
        kind: CommandKind::RulesShow,
        description: "post the rule files",
        needs_reply: false,
    },
    // Replies to arbitrary text, not to a job mirror, so the generic
    // reply-to-job resolution must not run for it.
    CommandSpec {
        triggers: &["rules:add"],
        kind: CommandKind::RulesAdd,
        description: "create a rule from the replied text",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["rules:edit"],
        kind: CommandKind::RulesEdit,
        description: "how to edit a posted rule",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["rules:delete"],
        kind: CommandKind::RulesDelete,
        description: "arm deletion of a posted rule",
        needs_reply: false,
    },
    CommandSpec {
        triggers: &["rules:reload"],
        kind: CommandKind::RulesReload,
        description: "reload the rules directory",
        needs_reply: false,
    },
];

/// Command dispatcher for the operator chat.
pub struct ControlPlane {
    transport: Arc<dyn ChatTransport>,
    store: Arc<JobStore>,
    rules: Arc<Mutex<RuleEngine>>,
    reporter: Arc<Reporter>,
    config: Arc<Config>,
    scheduler_tx: mpsc::Sender<ControlCommand>,
    /// Posted-rule-message id → rule file. Keyed by the message the agent
    /// created, not the operator's command message.
    rule_registry: Mutex<HashMap<i64, PathBuf>>,
    delete_armed: AtomicBool,
    quit_requested: AtomicBool,
}

impl ControlPlane {
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<JobStore>,
        rules: Arc<Mutex<RuleEngine>>,
        reporter: Arc<Reporter>,
        config: Arc<Config>,
        scheduler_tx: mpsc::Sender<ControlCommand>,
    ) -> Self {
        Self {
            transport,
            store,
            rules,
            reporter,
            config,
            scheduler_tx,
            rule_registry: Mutex::new(HashMap::new()),
            delete_armed: AtomicBool::new(false),
            quit_requested: AtomicBool::new(false),
        }
    }

    /// Whether `quit` has been received.
    #[must_use]
    pub fn quit_requested(&self) -> bool {
        self.quit_requested.load(Ordering::SeqCst)
    }

    /// Dispatch a message in the operator chat. Returns `true` when the
    /// message was a recognised command.
    pub async fn handle_message(&self, message: &InboundMessage) -> EngineResult<bool> {
        let first_line = message.first_line();
        let Some(trigger) = first_line.split_whitespace().next() else {
            return Ok(false);
        };
        let trigger = trigger.to_ascii_lowercase();
        let Some(spec) = COMMANDS
            .iter()
            .find(|spec| spec.triggers.contains(&trigger.as_str()))
        else {
            return Ok(false);
        };

        let args = first_line[trigger.len()..].trim().to_string();
        let reply = match self.resolve_reply(message, spec).await? {
            ReplyResolution::NotNeeded => None,
            ReplyResolution::Found(job) => Some(job),
            ReplyResolution::Missing => return Ok(true),
        };

        tracing::info!(trigger = %trigger, "command dispatched");
        match spec.kind {
            CommandKind::Help => self.cmd_help().await,
            CommandKind::Quit => self.cmd_quit().await,
            CommandKind::Status => self.cmd_status().await,
            CommandKind::DownloadOn => self.cmd_download_on().await,
            CommandKind::DownloadOff => self.cmd_download_off().await,
            CommandKind::DownloadClean => self.cmd_download_clean().await,
            CommandKind::DownloadCount => self.cmd_download_count().await,
            CommandKind::Rename => {
                if let Some(job) = reply.as_ref() {
                    self.cmd_rename(message, job, &args).await;
                }
            }
            CommandKind::SetTarget => {
                if let Some(job) = reply.as_ref() {
                    self.cmd_set_target(job, &args).await;
                }
            }
            CommandKind::Pin => {
                if let Some(job) = reply.as_ref() {
                    self.cmd_set_pin(job, true).await;
                }
            }
            CommandKind::Unpin => {
                if let Some(job) = reply.as_ref() {
                    self.cmd_set_pin(job, false).await;
                }
            }
            CommandKind::Info => {
                if let Some(job) = reply.as_ref() {
                    self.cmd_info(job).await;
                }
            }
            CommandKind::RulesShow => self.cmd_rules_show().await,
            CommandKind::RulesAdd => self.cmd_rules_add(message, &args).await,
            CommandKind::RulesEdit => self.cmd_rules_edit().await,
            CommandKind::RulesDelete => self.cmd_rules_delete().await,
            CommandKind::RulesReload => self.cmd_rules_reload().await,
        }
        Ok(true)
    }

    /// React to an edited message: a registered rule message rewrites its
    /// rule file.
    pub async fn handle_edited(&self, message: &InboundMessage) {
        let path = {
            let registry = self.rule_registry.lock().unwrap();
            registry.get(&message.id).cloned()
        };
        let Some(path) = path else { return };

        let result = {
            let mut rules = self.rules.lock().unwrap();
            rules.edit_rule_file(&path, &message.text)
        };
        match result {
            Ok(()) => {
                tracing::info!(rule = %path.display(), "rule updated from chat");
                self.reporter
                    .service_message(&format!("rule updated: {}", path.display()), SERVICE_TTL)
                    .await;
            }
            Err(e) => {
                self.reporter
                    .service_message(&format!("rule rejected: {e}"), SERVICE_TTL)
                    .await;
            }
        }
    }

    /// React to deleted operator-chat messages: mirrors drop their jobs,
    /// and (when armed) a registered rule message retires its file.
    pub async fn handle_deleted(&self, ids: &[i64]) {
        for &id in ids {
            match self.store.get_by_mirror(id) {
                Ok(Some(_job)) => {
                    tracing::info!(job = id, "mirror deleted by operator, dropping job");
                    let _ = self.store.delete(id);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "store lookup failed"),
            }

            let path = {
                let registry = self.rule_registry.lock().unwrap();
                registry.get(&id).cloned()
            };
            if let Some(path) = path {
                if self.delete_armed.swap(false, Ordering::SeqCst) {
                    let result = {
                        let mut rules = self.rules.lock().unwrap();
                        rules.delete_rule_file(&path)
                    };
                    match result {
                        Ok(()) => {
                            self.rule_registry.lock().unwrap().remove(&id);
                            self.reporter
                                .service_message(
                                    &format!("rule deleted: {}", path.display()),
                                    SERVICE_TTL,
                                )
                                .await;
                        }
                        Err(e) => {
                            self.reporter
                                .service_message(&format!("rule delete failed: {e}"), SERVICE_TTL)
                                .await;
                        }
                    }
                }
            }
        }
    }

    async fn resolve_reply(
        &self,
        message: &InboundMessage,
        spec: &CommandSpec,
    ) -> EngineResult<ReplyResolution> {
        if !spec.needs_reply {
            return Ok(ReplyResolution::NotNeeded);
        }
        let Some(reply_id) = message.reply_to else {
            self.reporter
                .service_message("this command must reply to a job message", SERVICE_TTL)
                .await;
            return Ok(ReplyResolution::Missing);
        };
        match self.store.get_by_mirror(reply_id) {
            Ok(Some(job)) => Ok(ReplyResolution::Found(job)),
            Ok(None) => {
                self.reporter
                    .service_message("the replied message is not a tracked job", SERVICE_TTL)
                    .await;
                Ok(ReplyResolution::Missing)
            }
            Err(e) => {
                tracing::warn!(error = %e, "store lookup failed");
                Ok(ReplyResolution::Missing)
            }
        }
    }

    async fn cmd_help(&self) {
        let mut lines = vec!["commands:".to_string()];
        for spec in COMMANDS {
            let reply = if spec.needs_reply { " (reply)" } else { "" };
            lines.push(format!(
                "{} - {}{}",
                spec.triggers.join(", "),
                spec.description,
                reply
            ));
        }
        self.reporter.service_message(&lines.join("\n"), HELP_TTL).await;
    }

    async fn cmd_quit(&self) {
        self.quit_requested.store(true, Ordering::SeqCst);
        let _ = self.scheduler_tx.send(ControlCommand::Quit).await;
        self.reporter.service_message("quitting", SERVICE_TTL).await;
    }

    async fn cmd_status(&self) {
        let summary = self.config.redacted_summary();
        if let Err(e) = self
            .transport
            .send_message(&self.config.personal_chat, &summary)
            .await
        {
            tracing::warn!(error = %e, "status reply failed");
        }
    }

    async fn cmd_download_on(&self) {
        let _ = self.scheduler_tx.send(ControlCommand::StartDownloads).await;
        self.reporter.service_message("downloads started", SERVICE_TTL).await;
    }

    async fn cmd_download_off(&self) {
        let _ = self.scheduler_tx.send(ControlCommand::StopDownloads).await;
        self.reporter.service_message("downloads stopped", SERVICE_TTL).await;
    }

    async fn cmd_download_clean(&self) {
        let jobs = match self.store.list_all() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "store scan failed");
                return;
            }
        };
        let mut removed = 0usize;
        for job in jobs {
            let board = self.reporter.board(job.mirror_msg_id).await;
            if let Ok(Some(board)) = board {
                if board.status() == Some(JobStatus::Completed) {
                    let _ = self
                        .transport
                        .delete_message(&self.config.personal_chat, job.mirror_msg_id)
                        .await;
                    let _ = self.store.delete(job.mirror_msg_id);
                    removed += 1;
                }
            }
        }
        self.reporter
            .service_message(&format!("cleaned {removed} completed job(s)"), SERVICE_TTL)
            .await;
    }

    async fn cmd_download_count(&self) {
        let jobs = match self.store.list_all() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "store scan failed");
                return;
            }
        };
        let mut counts: HashMap<JobStatus, usize> = HashMap::new();
        for job in &jobs {
            if let Ok(Some(board)) = self.reporter.board(job.mirror_msg_id).await {
                if let Some(status) = board.status() {
                    *counts.entry(status).or_default() += 1;
                }
            }
        }
        let mut lines = vec![format!("{} job(s)", jobs.len())];
        for status in JobStatus::ALL {
            if let Some(count) = counts.get(&status) {
                lines.push(format!("{status}: {count}"));
            }
        }
        self.reporter.service_message(&lines.join("\n"), SERVICE_TTL).await;
    }

    async fn cmd_rename(&self, message: &InboundMessage, job: &JobRecord, args: &str) {
        let new_name = args.trim();
        if new_name.is_empty() {
            self.reporter
                .service_message("usage: download:rename <new name>", SERVICE_TTL)
                .await;
            return;
        }
        let cleaned = sanitize_display_name(new_name);
        let patch = JobPatch {
            display_name: Some(cleaned.clone()),
            ..JobPatch::default()
        };
        match self.store.merge(job.mirror_msg_id, &patch) {
            Ok(_) => {
                self.reporter
                    .set_line(job.mirror_msg_id, LINE_VIDEO_NAME, &cleaned)
                    .await;
                let _ = self
                    .transport
                    .delete_message(&self.config.personal_chat, message.id)
                    .await;
            }
            Err(e) => {
                self.reporter
                    .service_message(&format!("rename failed: {e}"), SERVICE_TTL)
                    .await;
            }
        }
    }

    async fn cmd_set_target(&self, job: &JobRecord, args: &str) {
        let path = Path::new(args.trim());
        if args.trim().is_empty() || !path.is_absolute() {
            self.reporter
                .service_message("usage: download:settarget /absolute/folder", SERVICE_TTL)
                .await;
            return;
        }
        if !path.is_dir() {
            self.reporter
                .service_message(&format!("no such folder: {}", path.display()), SERVICE_TTL)
                .await;
            return;
        }
        let patch = JobPatch {
            target_folder: Some(path.to_path_buf()),
            ..JobPatch::default()
        };
        match self.store.merge(job.mirror_msg_id, &patch) {
            Ok(_) => {
                self.reporter
                    .set_line_with_icon(
                        job.mirror_msg_id,
                        LINE_TARGET_FOLDER,
                        &vidvault_core::util::fmt::abbreviate_path(path),
                    )
                    .await;
            }
            Err(e) => {
                self.reporter
                    .service_message(&format!("settarget failed: {e}"), SERVICE_TTL)
                    .await;
            }
        }
    }

    async fn cmd_set_pin(&self, job: &JobRecord, pinned: bool) {
        let patch = JobPatch {
            pinned: Some(pinned),
            ..JobPatch::default()
        };
        if let Err(e) = self.store.merge(job.mirror_msg_id, &patch) {
            self.reporter
                .service_message(&format!("pin update failed: {e}"), SERVICE_TTL)
                .await;
            return;
        }
        let chat = &self.config.personal_chat;
        let result = if pinned {
            self.transport.pin_message(chat, job.mirror_msg_id).await
        } else {
            self.transport.unpin_message(chat, job.mirror_msg_id).await
        };
        if let Err(e) = result {
            tracing::debug!(job = job.mirror_msg_id, error = %e, "pin/unpin failed");
        }
        let text = if pinned { "pinned" } else { "" };
        self.reporter
            .set_line_with_icon(job.mirror_msg_id, LINE_PINNED, text)
            .await;
    }

    async fn cmd_info(&self, job: &JobRecord) {
        let dump = serde_json::to_string_pretty(job)
            .unwrap_or_else(|e| format!("serialization failed: {e}"));
        if let Err(e) = self
            .transport
            .send_message(&self.config.personal_chat, &dump)
            .await
        {
            tracing::warn!(error = %e, "info reply failed");
        }
    }

    async fn cmd_rules_show(&self) {
        let files: Vec<(PathBuf, String)> = {
            let rules = self.rules.lock().unwrap();
            rules
                .rules()
                .iter()
                .filter_map(|rule| {
                    std::fs::read_to_string(&rule.source_path)
                        .ok()
                        .map(|text| (rule.source_path.clone(), text))
                })
                .collect()
        };
        if files.is_empty() {
            self.reporter.service_message("no rules loaded", SERVICE_TTL).await;
            return;
        }
        for (path, text) in files {
            let body = format!("# {}\n{text}", path.display());
            match self
                .transport
                .send_message(&self.config.personal_chat, &body)
                .await
            {
                Ok(posted_id) => {
                    self.rule_registry.lock().unwrap().insert(posted_id, path);
                }
                Err(e) => tracing::warn!(error = %e, "rules:show post failed"),
            }
        }
    }

    async fn cmd_rules_add(&self, message: &InboundMessage, args: &str) {
        let name = args.split_whitespace().next().unwrap_or("").to_string();
        if name.is_empty() {
            self.reporter
                .service_message("usage: rules:add <name> (reply to the rule text)", SERVICE_TTL)
                .await;
            return;
        }
        let Some(reply_id) = message.reply_to else {
            self.reporter
                .service_message("reply to a message holding the rule text", SERVICE_TTL)
                .await;
            return;
        };
        let body = match self
            .transport
            .fetch_message(&self.config.personal_chat, reply_id)
            .await
        {
            Ok(Some(m)) => m.text,
            _ => {
                self.reporter
                    .service_message("cannot read the replied message", SERVICE_TTL)
                    .await;
                return;
            }
        };
        let result = {
            let mut rules = self.rules.lock().unwrap();
            rules.add_rule_file(&name, &body)
        };
        match result {
            Ok(path) => {
                self.reporter
                    .service_message(&format!("rule created: {}", path.display()), SERVICE_TTL)
                    .await;
            }
            Err(e) => {
                self.reporter
                    .service_message(&format!("rule rejected: {e}"), SERVICE_TTL)
                    .await;
            }
        }
    }

    async fn cmd_rules_edit(&self) {
        self.reporter
            .service_message(
                "post the rules with rules:show, then edit a posted message to rewrite its file",
                SERVICE_TTL,
            )
            .await;
    }

    async fn cmd_rules_delete(&self) {
        self.delete_armed.store(true, Ordering::SeqCst);
        self.reporter
            .service_message(
                "delete a posted rule message (rules:show) to retire its file",
                SERVICE_TTL,
            )
            .await;
    }

    async fn cmd_rules_reload(&self) {
        self.rules.lock().unwrap().reload();
        self.reporter.service_message("rules reloaded", SERVICE_TTL).await;
    }
}

enum ReplyResolution {
    NotNeeded,
    Found(JobRecord),
    Missing,
}
