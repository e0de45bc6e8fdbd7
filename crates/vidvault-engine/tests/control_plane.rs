//! Operator command dispatch over the in-memory transport.

mod common;

use std::sync::Arc;

use tokio::sync::mpsc;

use vidvault_core::board::LINE_VIDEO_NAME;
use vidvault_core::job::JobStatus;
use vidvault_engine::control::ControlPlane;
use vidvault_engine::download::DownloadEnd;
use vidvault_engine::scheduler::ControlCommand;

use common::{Harness, harness, harness_with, roomy_disk};

fn control(h: &Harness) -> (Arc<ControlPlane>, mpsc::Receiver<ControlCommand>) {
    let (tx, rx) = mpsc::channel(16);
    let plane = Arc::new(ControlPlane::new(
        h.transport.clone(),
        Arc::clone(&h.store),
        Arc::clone(&h.rules),
        Arc::clone(&h.reporter),
        Arc::clone(&h.config),
        tx,
    ));
    (plane, rx)
}

#[tokio::test(start_paused = true)]
async fn unknown_text_is_not_a_command() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let message = h.transport.push_text_message("me", "just chatting", None);
    assert!(!plane.handle_message(&message).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn quit_reaches_the_scheduler() {
    let h = harness();
    let (plane, mut rx) = control(&h);
    let message = h.transport.push_text_message("me", "quit", None);
    assert!(plane.handle_message(&message).await.unwrap());
    assert_eq!(rx.recv().await, Some(ControlCommand::Quit));
    assert!(plane.quit_requested());
}

#[tokio::test(start_paused = true)]
async fn download_toggles_map_to_commands() {
    let h = harness();
    let (plane, mut rx) = control(&h);

    let on = h.transport.push_text_message("me", "download:on", None);
    plane.handle_message(&on).await.unwrap();
    assert_eq!(rx.recv().await, Some(ControlCommand::StartDownloads));

    let off = h.transport.push_text_message("me", "dl:stop", None);
    plane.handle_message(&off).await.unwrap();
    assert_eq!(rx.recv().await, Some(ControlCommand::StopDownloads));
}

#[tokio::test(start_paused = true)]
async fn help_lists_every_trigger() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let message = h.transport.push_text_message("me", "help", None);
    plane.handle_message(&message).await.unwrap();

    let posted = h.transport.messages("me");
    let help = posted
        .iter()
        .find(|m| m.text.contains("commands:"))
        .expect("help message posted");
    assert!(help.text.contains("download:settarget"));
    assert!(help.text.contains("rules:reload"));
}

#[tokio::test(start_paused = true)]
async fn status_redacts_secrets() {
    let h = harness_with(roomy_disk(), |config| {
        config.api_hash = "deadbeef".to_string();
    });
    let (plane, _rx) = control(&h);
    let message = h.transport.push_text_message("me", "status", None);
    plane.handle_message(&message).await.unwrap();

    let posted = h.transport.messages("me");
    let status = posted
        .iter()
        .find(|m| m.text.contains("max_simultaneous_file_to_download"))
        .expect("status reply posted");
    assert!(!status.text.contains("api_hash=deadbeef"));
}

#[tokio::test(start_paused = true)]
async fn rename_updates_record_and_board() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let mirror = h.acquire_video("Wrong Name", "clip.mp4", vec![1u8; 16]).await;

    let command = h
        .transport
        .push_text_message("me", "download:rename Proper  Name", Some(mirror));
    assert!(plane.handle_message(&command).await.unwrap());

    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    assert_eq!(job.display_name, "Proper Name");
    let board = h.reporter.board(mirror).await.unwrap().unwrap();
    assert_eq!(board.line(LINE_VIDEO_NAME), "Proper Name");
    // The command message is consumed.
    assert!(h.transport.message("me", command.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn rename_without_reply_is_rejected() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let mirror = h.acquire_video("Kept Name", "clip.mp4", vec![1u8; 16]).await;

    let command = h.transport.push_text_message("me", "rename Other", None);
    assert!(plane.handle_message(&command).await.unwrap());
    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    assert_eq!(job.display_name, "Kept Name");
}

#[tokio::test(start_paused = true)]
async fn settarget_validates_the_folder() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let mirror = h.acquire_video("Movable", "clip.mp4", vec![1u8; 16]).await;
    let original_target = h.store.get_by_mirror(mirror).unwrap().unwrap().target_folder;

    // Relative paths and missing folders are rejected.
    for bad in ["relative/path", "/definitely/not/there"] {
        let command = h
            .transport
            .push_text_message("me", &format!("download:settarget {bad}"), Some(mirror));
        plane.handle_message(&command).await.unwrap();
        let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
        assert_eq!(job.target_folder, original_target);
    }

    let good = h.config.completed_folder.join("elsewhere");
    std::fs::create_dir_all(&good).unwrap();
    let command = h.transport.push_text_message(
        "me",
        &format!("download:settarget {}", good.display()),
        Some(mirror),
    );
    plane.handle_message(&command).await.unwrap();
    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    assert_eq!(job.target_folder, good);
}

#[tokio::test(start_paused = true)]
async fn pin_and_unpin_flip_record_and_mirror() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let mirror = h.acquire_video("Pinnable", "clip.mp4", vec![1u8; 16]).await;

    let pin = h.transport.push_text_message("me", "download:pin", Some(mirror));
    plane.handle_message(&pin).await.unwrap();
    assert!(h.store.get_by_mirror(mirror).unwrap().unwrap().pinned);
    assert!(h.transport.message("me", mirror).unwrap().pinned);

    let unpin = h.transport.push_text_message("me", "download:unpin", Some(mirror));
    plane.handle_message(&unpin).await.unwrap();
    assert!(!h.store.get_by_mirror(mirror).unwrap().unwrap().pinned);
    assert!(!h.transport.message("me", mirror).unwrap().pinned);
}

#[tokio::test(start_paused = true)]
async fn info_dumps_the_record() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let mirror = h.acquire_video("Inspected", "clip.mp4", vec![1u8; 16]).await;

    let command = h.transport.push_text_message("me", "download:info", Some(mirror));
    plane.handle_message(&command).await.unwrap();

    let posted = h.transport.messages("me");
    assert!(
        posted
            .iter()
            .any(|m| m.text.contains("\"artifact_id\"") && m.text.contains("Inspected"))
    );
}

#[tokio::test(start_paused = true)]
async fn count_groups_by_badge() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let done = h.acquire_video("Done", "done.mp4", vec![1u8; 16]).await;
    let _waiting = h.acquire_video("Waiting", "wait.mp4", vec![2u8; 16]).await;
    assert_eq!(h.run_job(done).await, DownloadEnd::Completed);

    let command = h.transport.push_text_message("me", "download:count", None);
    plane.handle_message(&command).await.unwrap();

    let posted = h.transport.messages("me");
    let count = posted
        .iter()
        .find(|m| m.text.contains("job(s)"))
        .expect("count reply posted");
    assert!(count.text.contains("completed: 1"));
    assert!(count.text.contains("acquired: 1"));
}

#[tokio::test(start_paused = true)]
async fn clean_removes_completed_mirrors() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let done = h.acquire_video("Done", "done.mp4", vec![1u8; 16]).await;
    let waiting = h.acquire_video("Waiting", "wait.mp4", vec![2u8; 16]).await;
    assert_eq!(h.run_job(done).await, DownloadEnd::Completed);

    let command = h.transport.push_text_message("me", "download:clean", None);
    plane.handle_message(&command).await.unwrap();

    assert!(h.transport.message("me", done).is_none());
    assert!(h.store.get_by_mirror(done).unwrap().is_none());
    assert!(h.transport.message("me", waiting).is_some());
    assert!(h.store.get_by_mirror(waiting).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn rules_add_show_edit_round_trip() {
    let h = harness();
    let (plane, _rx) = control(&h);

    let body = h.transport.push_text_message(
        "me",
        "on:message:pattern=\".*\"\naction:message:translate=\"X\"",
        None,
    );
    let add = h
        .transport
        .push_text_message("me", "rules:add catchall", Some(body.id));
    plane.handle_message(&add).await.unwrap();
    assert_eq!(h.rules.lock().unwrap().rules().len(), 1);
    assert!(h.config.rules_folder.join("catchall.rule").exists());

    let show = h.transport.push_text_message("me", "rules:show", None);
    plane.handle_message(&show).await.unwrap();
    let posted = h.transport.messages("me");
    // rules:show prefixes the file path, which tells the posted copy apart
    // from the original rule-body message.
    let shown = posted
        .iter()
        .find(|m| m.text.starts_with("# ") && m.text.contains("on:message:pattern"))
        .expect("rule posted");

    // Editing the posted message rewrites the file and reloads.
    let mut edited = shown.clone();
    edited.text = "on:message:pattern=\"special (\\d+)\"\naction:message:translate=\"S{0}\""
        .to_string();
    plane.handle_edited(&edited).await;
    let text = std::fs::read_to_string(h.config.rules_folder.join("catchall.rule")).unwrap();
    assert!(text.contains("special"));
}

#[tokio::test(start_paused = true)]
async fn deleted_mirror_drops_the_job() {
    let h = harness();
    let (plane, _rx) = control(&h);
    let mirror = h.acquire_video("Doomed", "doomed.mp4", vec![1u8; 16]).await;

    plane.handle_deleted(&[mirror]).await;
    assert!(h.store.get_by_mirror(mirror).unwrap().is_none());
}

/// Property 6: once a board shows COMPLETED, no later edit changes the badge.
#[tokio::test(start_paused = true)]
async fn completed_badge_is_final() {
    let h = harness();
    let mirror = h.acquire_video("Finished", "fin.mp4", vec![1u8; 16]).await;
    assert_eq!(h.run_job(mirror).await, DownloadEnd::Completed);

    h.reporter.set_status(mirror, JobStatus::Downloading).await;
    h.reporter.set_status(mirror, JobStatus::Error).await;
    assert_eq!(h.badge(mirror).await, Some(JobStatus::Completed));
}
