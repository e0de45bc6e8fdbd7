//! Name sanitization and media-type detection.
//!
//! Display names come from chat text; filenames come from document
//! attributes. Both may carry path separators, control characters, or
//! markdown decoration that must never reach the filesystem.

use std::sync::LazyLock;

use regex::Regex;

/// Extensions recognised as video artifacts.
pub const VIDEO_EXTENSIONS: [&str; 8] = ["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "mpv"];

static RESERVED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());
static NON_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s.\-]").unwrap());
static MARKDOWN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_`~\[\]()#>]").unwrap());
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip reserved path characters and anything non-word from a filename.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = RESERVED.replace_all(name, "");
    let cleaned = NON_NAME.replace_all(&cleaned, "");
    cleaned.trim().to_string()
}

/// Sanitize a human-facing title: same character policy as filenames, but
/// runs of whitespace collapse to one space.
#[must_use]
pub fn sanitize_display_name(name: &str) -> String {
    let cleaned = sanitize_filename(name);
    SPACES.replace_all(&cleaned, " ").trim().to_string()
}

/// Remove markdown decoration chat clients like to inject.
#[must_use]
pub fn strip_markdown(text: &str) -> String {
    MARKDOWN.replace_all(text, "").to_string()
}

/// Whether the filename's extension marks it as a video.
#[must_use]
pub fn is_video_file(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Sanitized stem of a filename (everything before the last dot).
#[must_use]
pub fn file_stem(name: &str) -> String {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    sanitize_filename(stem)
}
