//! The nine-slot progress board.
//!
//! A mirror message's text is an ordered set of labeled lines. The board is
//! a pure line model with a parse/render round-trip; all chat I/O lives in
//! the engine's reporter. Slot numbers are 1-based and stable: external
//! tooling greps mirror messages by line position.

use crate::job::{JobRecord, JobStatus};

/// Slot 1: status badge.
pub const LINE_STATUS: usize = 1;
/// Slot 2: display name.
pub const LINE_VIDEO_NAME: usize = 2;
/// Slot 3: file basename.
pub const LINE_FILE_NAME: usize = 3;
/// Slot 4: file size, optionally with the estimated compressed size.
pub const LINE_FILE_SIZE: usize = 4;
/// Slot 5: media geometry.
pub const LINE_GEOMETRY: usize = 5;
/// Slot 6: pinned flag.
pub const LINE_PINNED: usize = 6;
/// Slot 7: info line (progress percent + ETA).
pub const LINE_INFO: usize = 7;
/// Slot 8: abbreviated target folder.
pub const LINE_TARGET_FOLDER: usize = 8;
/// Slot 9: last error.
pub const LINE_LAST_ERROR: usize = 9;

const SLOT_COUNT: usize = 9;

/// Default icon prefixed by [`ProgressBoard::set_line_with_icon`], per slot.
#[must_use]
pub const fn default_icon(slot: usize) -> &'static str {
    match slot {
        LINE_FILE_SIZE => "\u{1f4be}",          // 💾
        LINE_GEOMETRY => "\u{1f4d0}",           // 📐
        LINE_PINNED => "\u{1f4cc}",             // 📌
        LINE_INFO => "\u{1f514}",               // 🔔
        LINE_TARGET_FOLDER => "\u{1f4c1}",      // 📁
        LINE_LAST_ERROR => "\u{203c}\u{fe0f}",  // ‼️
        _ => "",
    }
}

/// Ordered line model of a mirror message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressBoard {
    lines: Vec<String>,
}

impl ProgressBoard {
    /// Empty board.
    #[must_use]
    pub const fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Parse the current text of a mirror message.
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    /// Fresh board for a newly acquired job.
    #[must_use]
    pub fn for_job(job: &JobRecord) -> Self {
        let mut board = Self::new();
        board.set_status(JobStatus::Acquired);
        board.set_line(LINE_VIDEO_NAME, &job.display_name);
        board.set_line(LINE_FILE_NAME, &job.file_name);
        board.set_line_with_icon(
            LINE_FILE_SIZE,
            &crate::util::fmt::format_bytes(job.size_bytes),
        );
        if let Some(geometry) = job.geometry {
            board.set_line_with_icon(LINE_GEOMETRY, &geometry.to_string());
        }
        if job.pinned {
            board.set_line_with_icon(LINE_PINNED, "pinned");
        }
        board.set_line_with_icon(
            LINE_TARGET_FOLDER,
            &crate::util::fmt::abbreviate_path(&job.target_folder),
        );
        board
    }

    /// Replace one slot, padding intermediate slots with empty lines.
    pub fn set_line(&mut self, slot: usize, text: &str) {
        debug_assert!((1..=SLOT_COUNT).contains(&slot));
        while self.lines.len() < slot {
            self.lines.push(String::new());
        }
        self.lines[slot - 1] = text.replace('\n', " ");
    }

    /// Replace one slot, prefixing the slot's default icon.
    pub fn set_line_with_icon(&mut self, slot: usize, text: &str) {
        let icon = default_icon(slot);
        if icon.is_empty() {
            self.set_line(slot, text);
        } else {
            self.set_line(slot, &format!("{icon} {text}"));
        }
    }

    /// Read one slot; empty string when the slot was never written.
    #[must_use]
    pub fn line(&self, slot: usize) -> &str {
        self.lines
            .get(slot.saturating_sub(1))
            .map_or("", String::as_str)
    }

    /// Write the badge into slot 1.
    pub fn set_status(&mut self, status: JobStatus) {
        self.set_line(LINE_STATUS, status.badge());
    }

    /// Badge currently shown in slot 1, if any.
    #[must_use]
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_badge(self.line(LINE_STATUS).trim())
    }

    /// Render back to message text.
    #[must_use]
    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

impl std::fmt::Display for ProgressBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_render_round_trip() {
        let text = "\u{1f7e2}\nShow E01\nshow_e01.mp4";
        let board = ProgressBoard::from_text(text);
        assert_eq!(board.render(), text);
        assert_eq!(board.status(), Some(JobStatus::Acquired));
        assert_eq!(board.line(LINE_VIDEO_NAME), "Show E01");
    }

    #[test]
    fn set_line_pads_missing_slots() {
        let mut board = ProgressBoard::new();
        board.set_line(LINE_LAST_ERROR, "disk full");
        assert_eq!(board.line(LINE_LAST_ERROR), "disk full");
        assert_eq!(board.line(LINE_INFO), "");
        assert_eq!(board.render().lines().count(), 9);
    }

    #[test]
    fn set_line_strips_newlines() {
        let mut board = ProgressBoard::new();
        board.set_line(LINE_VIDEO_NAME, "two\nlines");
        assert_eq!(board.line(LINE_VIDEO_NAME), "two lines");
        // Injected newlines must not shift later slots.
        board.set_line(LINE_FILE_NAME, "file.mp4");
        assert_eq!(board.line(LINE_FILE_NAME), "file.mp4");
    }

    #[test]
    fn status_transitions_replace_slot_one_only() {
        let mut board = ProgressBoard::new();
        board.set_status(JobStatus::Acquired);
        board.set_line(LINE_VIDEO_NAME, "name");
        board.set_status(JobStatus::Downloading);
        assert_eq!(board.status(), Some(JobStatus::Downloading));
        assert_eq!(board.line(LINE_VIDEO_NAME), "name");
    }

    #[test]
    fn icons_applied_per_slot() {
        let mut board = ProgressBoard::new();
        board.set_line_with_icon(LINE_PINNED, "pinned");
        assert_eq!(board.line(LINE_PINNED), "\u{1f4cc} pinned");
        // Slots without a default icon fall through to a plain write.
        board.set_line_with_icon(LINE_VIDEO_NAME, "name");
        assert_eq!(board.line(LINE_VIDEO_NAME), "name");
    }
}
