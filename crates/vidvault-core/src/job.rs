//! Job domain types.
//!
//! A [`JobRecord`] tracks one remote artifact from acquisition to placement.
//! Records are persisted as JSON by the store crate; unknown fields
//! round-trip through the flattened `extra` map so older/newer agents can
//! share a job directory.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle badge shown in slot 1 of the progress board.
///
/// The glyph set doubles as the acquisition idempotence marker: any caption
/// containing one of these glyphs was produced by the agent itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job persisted, waiting for a download slot.
    Acquired,
    /// A worker is streaming bytes.
    Downloading,
    /// The transcoder is running.
    Compressing,
    /// Final file placed in the target folder.
    Completed,
    /// Mirror message (and job) removed by the operator.
    Deleted,
    /// Interrupted by the operator or by admission control.
    Cancelled,
    /// Terminal failure, kept for diagnosis.
    Error,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Acquired,
        Self::Downloading,
        Self::Compressing,
        Self::Completed,
        Self::Deleted,
        Self::Cancelled,
        Self::Error,
    ];

    /// One-glyph badge for the board.
    #[must_use]
    pub const fn badge(self) -> &'static str {
        match self {
            Self::Acquired => "\u{1f7e2}",     // 🟢
            Self::Downloading => "\u{2b07}\u{fe0f}", // ⬇️
            Self::Compressing => "\u{1f5dc}\u{fe0f}", // 🗜️
            Self::Completed => "\u{2705}",     // ✅
            Self::Deleted => "\u{274c}",       // ❌
            Self::Cancelled => "\u{1f6ab}",    // 🚫
            Self::Error => "\u{203c}\u{fe0f}", // ‼️
        }
    }

    /// Human-readable name, used by `download:count` and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Downloading => "downloading",
            Self::Compressing => "compressing",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Parse a badge glyph back into a status.
    #[must_use]
    pub fn from_badge(glyph: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.badge() == glyph)
    }

    /// Whether any of the badge glyphs occurs in `text`.
    #[must_use]
    pub fn text_bears_badge(text: &str) -> bool {
        Self::ALL.iter().any(|s| text.contains(s.badge()))
    }

    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Deleted | Self::Cancelled | Self::Error
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Width/height of the remote video, when the source advertises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaGeometry {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for MediaGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Persistent record for one artifact.
///
/// Keyed by `mirror_msg_id` (primary) and `artifact_id` (secondary); the
/// store enforces uniqueness of both. `original_name` is frozen at
/// acquisition; `display_name` is what the rule engine (or the operator)
/// made of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Id of the caption message in the operator chat that mirrors this job.
    pub mirror_msg_id: i64,
    /// Friendly key of the chat the media was observed in.
    pub source_chat: String,
    /// Id of the original media message.
    pub source_msg_id: i64,
    /// Bytes must be fetched from the source, not the mirror.
    #[serde(default)]
    pub forward_protected: bool,
    /// Stable id of the remote artifact.
    pub artifact_id: i64,
    /// Human-facing title, possibly rewritten by a rule.
    pub display_name: String,
    /// Title as first observed; never mutated after creation.
    pub original_name: String,
    /// Target filename, with extension.
    pub file_name: String,
    /// Absolute path of the in-progress download.
    pub staging_path: PathBuf,
    /// Destination folder after completion; may change while queued.
    pub target_folder: PathBuf,
    /// Media geometry, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<MediaGeometry>,
    /// Scheduling-priority flag, mirrors the upstream pin.
    #[serde(default)]
    pub pinned: bool,
    /// Terminal flag; a completed job is never re-queued.
    #[serde(default)]
    pub completed: bool,
    /// Authoritative size from the remote artifact.
    pub size_bytes: u64,
    /// Forward-origin chat id, matched by rule scope filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_chat_id: Option<i64>,
    /// Forward-origin username, matched by rule scope filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_chat_username: Option<String>,
    /// Forward-origin title, matched by rule scope filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_chat_title: Option<String>,
    /// Fields written by other agent versions, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobRecord {
    /// Staging sidecar holding partial bytes; its size is the resume point.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.staging_path.as_os_str().to_owned();
        name.push(".temp");
        PathBuf::from(name)
    }

    /// Scheduler sort key: pinned jobs first, then ascending artifact id.
    #[must_use]
    pub const fn schedule_key(&self) -> (bool, i64) {
        (!self.pinned, self.artifact_id)
    }
}

/// Partial update for a [`JobRecord`]; only `Some` fields overwrite.
///
/// This is the merge side of the store's write-through contract: on
/// collision, supplied fields win and unspecified ones are preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl JobPatch {
    /// Apply this patch to a record in place.
    pub fn apply(&self, record: &mut JobRecord) {
        if let Some(ref name) = self.display_name {
            record.display_name.clone_from(name);
        }
        if let Some(ref file) = self.file_name {
            record.file_name.clone_from(file);
        }
        if let Some(ref folder) = self.target_folder {
            record.target_folder.clone_from(folder);
        }
        if let Some(pinned) = self.pinned {
            record.pinned = pinned;
        }
        if let Some(completed) = self.completed {
            record.completed = completed;
        }
    }

    /// True when no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.file_name.is_none()
            && self.target_folder.is_none()
            && self.pinned.is_none()
            && self.completed.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord {
            mirror_msg_id: 42,
            source_chat: "archive".to_string(),
            source_msg_id: 7,
            forward_protected: false,
            artifact_id: 900,
            display_name: "Show E01".to_string(),
            original_name: "Show Episode 01".to_string(),
            file_name: "show_e01.mp4".to_string(),
            staging_path: PathBuf::from("/staging/show_e01.mp4"),
            target_folder: PathBuf::from("/completed"),
            geometry: None,
            pinned: false,
            completed: false,
            size_bytes: 1024,
            origin_chat_id: None,
            origin_chat_username: None,
            origin_chat_title: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn badge_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_badge(status.badge()), Some(status));
        }
    }

    #[test]
    fn badge_detection_in_caption() {
        assert!(JobStatus::text_bears_badge("\u{1f7e2}\nShow E01"));
        assert!(!JobStatus::text_bears_badge("Show Episode 01\nsecond line"));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Downloading.is_terminal());
        assert!(!JobStatus::Acquired.is_terminal());
    }

    #[test]
    fn temp_path_appends_suffix() {
        assert_eq!(
            record().temp_path(),
            PathBuf::from("/staging/show_e01.mp4.temp")
        );
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = serde_json::json!({
            "mirror_msg_id": 1,
            "source_chat": "c",
            "source_msg_id": 2,
            "artifact_id": 3,
            "display_name": "n",
            "original_name": "n",
            "file_name": "n.mp4",
            "staging_path": "/s/n.mp4",
            "target_folder": "/t",
            "size_bytes": 10,
            "legacy_field": {"kept": true}
        });
        let record: JobRecord = serde_json::from_value(json).unwrap();
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["legacy_field"]["kept"], serde_json::json!(true));
    }

    #[test]
    fn patch_only_overwrites_supplied_fields() {
        let mut r = record();
        let patch = JobPatch {
            pinned: Some(true),
            ..JobPatch::default()
        };
        patch.apply(&mut r);
        assert!(r.pinned);
        assert_eq!(r.display_name, "Show E01");
        assert!(!patch.is_empty());
        assert!(JobPatch::default().is_empty());
    }

    #[test]
    fn schedule_key_orders_pinned_first() {
        let mut a = record();
        a.pinned = true;
        a.artifact_id = 5;
        let mut b = record();
        b.artifact_id = 1;
        let mut jobs = vec![b.clone(), a.clone()];
        jobs.sort_by_key(JobRecord::schedule_key);
        assert_eq!(jobs[0].artifact_id, 5);
        assert_eq!(jobs[1].artifact_id, 1);
    }
}
