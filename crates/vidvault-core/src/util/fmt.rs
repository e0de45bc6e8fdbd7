//! Human-readable formatting for the board.

use std::path::Path;
use std::time::Duration;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// `1536` → `"1.5 KiB"`.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// `Duration` → `"hh:mm:ss"`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Progress ratio → `"42.0%"`, clamped to 0..=100.
#[must_use]
pub fn format_percent(done: u64, total: u64) -> String {
    if total == 0 {
        return "0.0%".to_string();
    }
    #[allow(clippy::cast_precision_loss)]
    let pct = (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0);
    format!("{pct:.1}%")
}

/// Last two components of a path, prefixed with `…/` when abbreviated.
#[must_use]
pub fn abbreviate_path(path: &Path) -> String {
    let parts: Vec<_> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if parts.len() <= 2 {
        return path.display().to_string();
    }
    format!("\u{2026}/{}", parts[parts.len() - 2..].join("/"))
}
