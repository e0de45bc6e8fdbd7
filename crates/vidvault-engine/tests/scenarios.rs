//! End-to-end pipeline scenarios over the in-memory transport.
//!
//! Every test runs under a paused clock, so retry waits, settle delays, and
//! scheduler ticks elapse instantly while ordering stays real.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vidvault_core::job::JobStatus;
use vidvault_core::ports::{ChatTransport, DiskSpace};
use vidvault_core::testkit::StreamFault;
use vidvault_engine::acquire::AcquireOutcome;
use vidvault_engine::download::DownloadEnd;
use vidvault_engine::scheduler::{ControlCommand, Scheduler};

use common::{MockDisk, harness, harness_with, roomy_disk};

/// S1: three jobs, ceiling two; never more than two streams in flight, the
/// pinned job is admitted in the first pair, and every badge ends COMPLETED.
#[tokio::test(start_paused = true)]
async fn s1_concurrency_ceiling_and_pin_priority() {
    let h = harness();

    let mirror_a = h.acquire_video("Alpha", "a.mp4", vec![1u8; 64]).await;
    let mirror_b = h.acquire_video("Bravo", "b.mp4", vec![2u8; 64]).await;
    // The last-acquired job is the pinned one: without pin priority it
    // would be admitted last.
    let c = h.transport.push_video_message("archive", "Charlie", Some("c.mp4"), vec![3u8; 64]);
    h.transport.pin_message("archive", c.id).await.unwrap();
    let c = h.transport.message("archive", c.id).unwrap();
    let mirror_c = match h.acquirer.acquire(&c, &[]).await.unwrap() {
        AcquireOutcome::Created(mirror) => mirror,
        AcquireOutcome::Skipped => panic!("skipped"),
    };
    // The pin lives on the mirror message from here on.
    h.transport.pin_message("me", mirror_c).await.unwrap();

    let artifact_c = h.store.get_by_mirror(mirror_c).unwrap().unwrap().artifact_id;

    let (scheduler, tx) = Scheduler::new(
        Arc::clone(&h.downloader),
        Arc::clone(&h.store),
        Arc::clone(&h.reporter),
        Arc::clone(&h.config),
    );
    let handle = tokio::spawn(scheduler.run());

    for _ in 0..600 {
        if h.store.list_pending().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(h.store.list_pending().unwrap().is_empty(), "jobs did not finish");

    tx.send(ControlCommand::Quit).await.unwrap();
    handle.await.unwrap();

    assert!(h.transport.peak_streams() <= 2, "admission cap violated");
    let opens = h.transport.stream_opens();
    assert!(
        opens[..2].iter().any(|(artifact, _)| *artifact == artifact_c),
        "pinned job was not admitted first"
    );
    for mirror in [mirror_a, mirror_b, mirror_c] {
        assert_eq!(h.badge(mirror).await, Some(JobStatus::Completed));
    }
}

/// S2: an interrupted stream leaves the temp sidecar at exactly the bytes
/// written; the next attempt resumes from that offset, and the finished
/// file matches the source byte for byte.
#[tokio::test(start_paused = true)]
async fn s2_interrupt_then_resume_at_exact_offset() {
    let h = harness();
    let payload: Vec<u8> = (0..100u8).collect();
    let message = h
        .transport
        .push_video_message("archive", "Resumable", Some("resumable.mp4"), payload.clone());
    let artifact = message.media.as_ref().unwrap().artifact_id;
    h.transport
        .script_fault(artifact, StreamFault::Interrupt { after_bytes: 40 });

    let mirror = match h.acquirer.acquire(&message, &[]).await.unwrap() {
        AcquireOutcome::Created(mirror) => mirror,
        AcquireOutcome::Skipped => panic!("skipped"),
    };

    assert_eq!(h.run_job(mirror).await, DownloadEnd::Completed);

    let opens = h.transport.stream_opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0], (artifact, 0));
    assert_eq!(opens[1], (artifact, 40), "resume point is the temp size");

    let final_path = h
        .config
        .completed_folder
        .join("Resumable")
        .join("Resumable.mp4");
    assert_eq!(std::fs::read(&final_path).unwrap(), payload);

    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    assert!(job.completed);
    assert!(!job.temp_path().exists());
    assert_eq!(h.badge(mirror).await, Some(JobStatus::Completed));
}

/// A pre-cancelled worker exits without touching the resume point.
#[tokio::test(start_paused = true)]
async fn cancellation_preserves_the_temp_sidecar() {
    let h = harness();
    let mirror = h.acquire_video("Partial", "partial.mp4", vec![9u8; 100]).await;
    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    std::fs::create_dir_all(job.staging_path.parent().unwrap()).unwrap();
    std::fs::write(job.temp_path(), vec![9u8; 40]).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let end = h.downloader.run(job.clone(), token).await;

    assert_eq!(end, DownloadEnd::Cancelled);
    assert_eq!(std::fs::metadata(job.temp_path()).unwrap().len(), 40);
    assert_eq!(h.badge(mirror).await, Some(JobStatus::Cancelled));
    assert_eq!(h.transport.stream_opens().len(), 0);
}

/// S3: the unscoped episode rule rewrites the name and derives the folder;
/// the chat-scoped catch-all does not bind because the job carries no
/// forward origin.
#[tokio::test(start_paused = true)]
async fn s3_rule_rewrite_and_folder_derivation() {
    let root = tempfile::tempdir().unwrap();
    let media_root = root.path().join("media");
    let h = harness_with(roomy_disk(), |config| {
        config.rules_folder = root.path().join("rules");
        std::fs::create_dir_all(&config.rules_folder).unwrap();
        std::fs::write(
            config.rules_folder.join("episode.rule"),
            format!(
                "on:message:pattern=\".*Episode (\\d+).*\"\n\
                 on:folder:pattern=\"(\\w+) Episode.*\"\n\
                 action:message:translate=\"E{{0}}\"\n\
                 action:folder:completed=\"{}/#0\"\n",
                media_root.display()
            ),
        )
        .unwrap();
        std::fs::write(
            config.rules_folder.join("misc.rule"),
            "on:message:pattern=\".*\"\n\
             set:chat:name=\"public\"\n\
             action:message:translate=\"MISC\"\n",
        )
        .unwrap();
    });

    let mirror = h
        .acquire_video("Show Episode 07", "raw.mp4", vec![4u8; 64])
        .await;
    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    assert_eq!(job.display_name, "E07");
    assert_eq!(job.original_name, "Show Episode 07");

    assert_eq!(h.run_job(mirror).await, DownloadEnd::Completed);
    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    assert_eq!(job.target_folder, media_root.join("Show"));
    assert!(media_root.join("Show").join("E07").join("E07.mp4").exists());
}

/// S4: a flood-wait is retried (budget spent: one extra stream open) and
/// the download still completes.
#[tokio::test(start_paused = true)]
async fn s4_flood_wait_is_retried_once() {
    let h = harness();
    let message = h
        .transport
        .push_video_message("archive", "Flooded", Some("flooded.mp4"), vec![7u8; 64]);
    let artifact = message.media.as_ref().unwrap().artifact_id;
    h.transport.script_fault(artifact, StreamFault::FloodWait(7));

    let mirror = match h.acquirer.acquire(&message, &[]).await.unwrap() {
        AcquireOutcome::Created(mirror) => mirror,
        AcquireOutcome::Skipped => panic!("skipped"),
    };

    let started = tokio::time::Instant::now();
    assert_eq!(h.run_job(mirror).await, DownloadEnd::Completed);
    assert_eq!(h.transport.stream_opens().len(), 2);
    // N+1 seconds of flood wait are part of the elapsed virtual time.
    assert!(started.elapsed() >= Duration::from_secs(8));
}

/// S5: failing the free-space admission cancels the job without ever
/// opening a stream.
#[tokio::test(start_paused = true)]
async fn s5_disk_admission_cancels_the_job() {
    let mut disk = MockDisk::new();
    disk.expect_space().returning(|_| {
        Ok(DiskSpace {
            free_bytes: 30,
            total_bytes: 1000,
        })
    });
    let h = harness_with(disk, |config| {
        config.disk_space_limit_percentage = 10;
    });

    let mirror = h.acquire_video("Too Big", "big.mp4", vec![1u8; 64]).await;
    assert_eq!(h.run_job(mirror).await, DownloadEnd::DiskFull);
    assert_eq!(h.badge(mirror).await, Some(JobStatus::Cancelled));
    assert_eq!(h.transport.stream_opens().len(), 0);
    // The job record survives for a later resume.
    assert!(h.store.get_by_mirror(mirror).unwrap().is_some());
}

/// S6: an `.mpv` artifact is placed as `.mp4` under a per-title subfolder.
#[tokio::test(start_paused = true)]
async fn s6_mpv_extension_rewritten_on_placement() {
    let h = harness();
    let mirror = h
        .acquire_video("Old Container", "clip.mpv", vec![5u8; 64])
        .await;
    assert_eq!(h.run_job(mirror).await, DownloadEnd::Completed);

    let final_path = h
        .config
        .completed_folder
        .join("Old Container")
        .join("Old Container.mp4");
    assert!(final_path.exists(), "expected {}", final_path.display());
}

/// Property 4: feeding the same source message twice yields one job and one
/// mirror message; re-feeding the mirror itself is also a no-op.
#[tokio::test(start_paused = true)]
async fn idempotent_acquisition() {
    let h = harness();
    let message = h
        .transport
        .push_video_message("archive", "Once Only", Some("once.mp4"), vec![8u8; 32]);

    let first = h.acquirer.acquire(&message, &[]).await.unwrap();
    assert!(matches!(first, AcquireOutcome::Created(_)));
    let second = h.acquirer.acquire(&message, &[]).await.unwrap();
    assert_eq!(second, AcquireOutcome::Skipped);

    let mirrors: Vec<_> = h
        .transport
        .messages("me")
        .into_iter()
        .filter(|m| m.media.is_some())
        .collect();
    assert_eq!(mirrors.len(), 1);
    assert_eq!(h.store.list_all().unwrap().len(), 1);

    // The mirror's caption bears a badge, so it is never re-acquired.
    let echo = h.acquirer.acquire(&mirrors[0], &[]).await.unwrap();
    assert_eq!(echo, AcquireOutcome::Skipped);
}

/// A reply to the media message supplies the display name, and the reply is
/// consumed.
#[tokio::test(start_paused = true)]
async fn reply_title_wins_over_message_text() {
    let h = harness();
    let message = h
        .transport
        .push_video_message("archive", "ignored caption", Some("raw.mp4"), vec![1u8; 16]);
    let reply = h
        .transport
        .push_text_message("archive", "Proper Title\nsecond line", Some(message.id));

    let mirror = match h.acquirer.acquire(&message, &[reply.clone()]).await.unwrap() {
        AcquireOutcome::Created(mirror) => mirror,
        AcquireOutcome::Skipped => panic!("skipped"),
    };
    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    assert_eq!(job.display_name, "Proper Title");
    assert!(h.transport.message("archive", reply.id).is_none());
}

/// The duplicate-done admission short-circuits straight to placement.
#[tokio::test(start_paused = true)]
async fn finished_staging_file_short_circuits() {
    let h = harness();
    let payload = vec![6u8; 64];
    let mirror = h.acquire_video("Already Here", "done.mp4", payload.clone()).await;
    let job = h.store.get_by_mirror(mirror).unwrap().unwrap();
    std::fs::create_dir_all(job.staging_path.parent().unwrap()).unwrap();
    std::fs::write(&job.staging_path, &payload).unwrap();

    assert_eq!(h.run_job(mirror).await, DownloadEnd::Completed);
    assert_eq!(h.transport.stream_opens().len(), 0, "no stream was needed");
    assert_eq!(h.badge(mirror).await, Some(JobStatus::Completed));
}

/// Forward-protected sources stream from the source chat, not the mirror.
#[tokio::test(start_paused = true)]
async fn protected_source_streams_from_origin() {
    let h = harness();
    let payload = vec![3u8; 48];
    let message = h
        .transport
        .push_video_message("archive", "Guarded", Some("guarded.mp4"), payload.clone());
    h.transport.protect_message("archive", message.id);
    let message = h.transport.message("archive", message.id).unwrap();

    let mirror = match h.acquirer.acquire(&message, &[]).await.unwrap() {
        AcquireOutcome::Created(mirror) => mirror,
        AcquireOutcome::Skipped => panic!("skipped"),
    };
    // The source stays in place for protected chats.
    assert!(h.transport.message("archive", message.id).is_some());

    assert_eq!(h.run_job(mirror).await, DownloadEnd::Completed);
    let final_path = h.config.completed_folder.join("Guarded").join("Guarded.mp4");
    assert_eq!(std::fs::read(final_path).unwrap(), payload);
}
