//! Agent configuration.
//!
//! Line-oriented file: `[section]` headers, `key=value` pairs, `#` comments.
//! Unsectioned keys (or anything outside `[groups]`) configure the agent;
//! the `[groups]` section maps a friendly key to each watched chat name.
//! Values are typed, defaulted, and clamped here so the rest of the
//! pipeline never revalidates.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default concurrent download ceiling.
pub const DEFAULT_MAX_SIMULTANEOUS: usize = 2;
/// Default CRF for the transcoder.
pub const DEFAULT_COMPRESSION_RATIO: u8 = 28;
/// Default minimum input size (MiB) before the transcoder is considered.
pub const DEFAULT_COMPRESSION_MIN_SIZE_MB: u64 = 50;
/// Default disk-space admission threshold. Admission cancels a job when
/// the filesystem's used percentage would reach this limit; 100 disables
/// the check.
pub const DEFAULT_DISK_SPACE_LIMIT_PCT: u8 = 100;

/// Configuration load/parse failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected `key=value`, got {text:?}")]
    Malformed { line: usize, text: String },

    #[error("line {line}: invalid value for `{key}`: {value:?}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
}

/// Typed agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_id: String,
    pub api_hash: String,
    pub phone: String,
    pub session_name: String,
    /// Staging folder for in-progress downloads.
    pub download_folder: PathBuf,
    /// Default destination folder.
    pub completed_folder: PathBuf,
    /// Directory scanned for `*.rule` files.
    pub rules_folder: PathBuf,
    /// Directory holding the per-job JSON records.
    pub jobs_folder: PathBuf,
    /// Root of the spool transport adapter.
    pub spool_folder: PathBuf,
    /// Operator (command-and-status) chat key.
    pub personal_chat: String,
    pub max_simultaneous_downloads: usize,
    /// Chunk-size ceiling in KiB; 0 means unbounded.
    pub request_limit_kb: u64,
    pub enable_video_compression: bool,
    /// CRF, clamped to 0..=51.
    pub compression_ratio: u8,
    pub compression_min_size_mb: u64,
    /// Maximum used-space percentage a filesystem may reach once the
    /// artifact lands; past it, admission cancels the job.
    pub disk_space_limit_percentage: u8,
    /// Stop the download loop after every completed wave.
    pub lock_download: bool,
    /// Exit immediately with status 0.
    pub disabled: bool,
    /// Friendly key → watched chat name.
    pub groups: BTreeMap<String, String>,
}

impl Config {
    /// Configuration with defaults rooted at `root`.
    #[must_use]
    pub fn with_root(root: &Path) -> Self {
        Self {
            api_id: String::new(),
            api_hash: String::new(),
            phone: String::new(),
            session_name: "session_name".to_string(),
            download_folder: root.join("vv-staging"),
            completed_folder: root.join("vv-completed"),
            rules_folder: root.join("rules"),
            jobs_folder: root.join("jobs"),
            spool_folder: root.join("spool"),
            personal_chat: "me".to_string(),
            max_simultaneous_downloads: DEFAULT_MAX_SIMULTANEOUS,
            request_limit_kb: 0,
            enable_video_compression: false,
            compression_ratio: DEFAULT_COMPRESSION_RATIO,
            compression_min_size_mb: DEFAULT_COMPRESSION_MIN_SIZE_MB,
            disk_space_limit_percentage: DEFAULT_DISK_SPACE_LIMIT_PCT,
            lock_download: false,
            disabled: false,
            groups: BTreeMap::new(),
        }
    }

    /// Load from a config file; defaults are rooted at the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::parse(&text, &root)
    }

    /// Parse config text with defaults rooted at `root`.
    pub fn parse(text: &str, root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::with_root(root);
        let mut section = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_ascii_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    line: line_no,
                    text: line.to_string(),
                });
            };
            let key = key.trim();
            let value = value.trim();

            if section == "groups" {
                config.groups.insert(key.to_string(), value.to_string());
                continue;
            }
            config.set(line_no, key, value, root)?;
        }

        Ok(config)
    }

    fn set(&mut self, line: usize, key: &str, value: &str, root: &Path) -> Result<(), ConfigError> {
        let invalid = |key: &str| ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "api_id" => self.api_id = value.to_string(),
            "api_hash" => self.api_hash = value.to_string(),
            "phone" => self.phone = value.to_string(),
            "session_name" => self.session_name = value.to_string(),
            "personal_chat" => self.personal_chat = value.to_string(),
            "download_folder" => self.download_folder = resolve(root, value),
            "completed_folder" => self.completed_folder = resolve(root, value),
            "rules_folder" => self.rules_folder = resolve(root, value),
            "jobs_folder" => self.jobs_folder = resolve(root, value),
            "spool_folder" => self.spool_folder = resolve(root, value),
            "max_simultaneous_file_to_download" => {
                self.max_simultaneous_downloads =
                    value.parse().map_err(|_| invalid(key)).and_then(|n| {
                        if n == 0 { Err(invalid(key)) } else { Ok(n) }
                    })?;
            }
            "max_download_size_request_limit_kb" => {
                self.request_limit_kb = value.parse().map_err(|_| invalid(key))?;
            }
            "enable_video_compression" => self.enable_video_compression = value == "1",
            "compression_ratio" => {
                let crf: i64 = value.parse().map_err(|_| invalid(key))?;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    self.compression_ratio = crf.clamp(0, 51) as u8;
                }
            }
            "compression_min_size_mb" => {
                self.compression_min_size_mb = value.parse().map_err(|_| invalid(key))?;
            }
            "disk_space_limit_percentage" => {
                let pct: i64 = value.parse().map_err(|_| invalid(key))?;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                {
                    self.disk_space_limit_percentage = pct.clamp(0, 100) as u8;
                }
            }
            "lock_download" => self.lock_download = value == "1",
            "disabled" => self.disabled = value == "1",
            other => {
                tracing::warn!(key = other, line, "ignoring unknown config key");
            }
        }
        Ok(())
    }

    /// Create the folders the pipeline writes to and verify writability.
    pub fn ensure_folders(&self) -> crate::errors::EngineResult<()> {
        for folder in [
            &self.download_folder,
            &self.completed_folder,
            &self.jobs_folder,
            &self.rules_folder,
        ] {
            crate::util::disk::ensure_writable_dir(folder)?;
        }
        Ok(())
    }

    /// Multi-line summary for the `status` command; secrets redacted.
    #[must_use]
    pub fn redacted_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "api_id={}", self.api_id);
        let _ = writeln!(out, "api_hash={}", redact(&self.api_hash));
        let _ = writeln!(out, "phone={}", redact(&self.phone));
        let _ = writeln!(out, "session_name={}", self.session_name);
        let _ = writeln!(out, "download_folder={}", self.download_folder.display());
        let _ = writeln!(out, "completed_folder={}", self.completed_folder.display());
        let _ = writeln!(out, "rules_folder={}", self.rules_folder.display());
        let _ = writeln!(
            out,
            "max_simultaneous_file_to_download={}",
            self.max_simultaneous_downloads
        );
        let _ = writeln!(
            out,
            "max_download_size_request_limit_kb={}",
            self.request_limit_kb
        );
        let _ = writeln!(
            out,
            "enable_video_compression={}",
            u8::from(self.enable_video_compression)
        );
        let _ = writeln!(out, "compression_ratio={}", self.compression_ratio);
        let _ = writeln!(
            out,
            "compression_min_size_mb={}",
            self.compression_min_size_mb
        );
        let _ = writeln!(
            out,
            "disk_space_limit_percentage={}",
            self.disk_space_limit_percentage
        );
        let _ = writeln!(out, "groups={}", self.groups.len());
        out
    }
}

fn resolve(root: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn redact(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        "\u{2022}\u{2022}\u{2022}".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# agent credentials
api_id=12345
api_hash=deadbeef
phone=+1555000
session_name=agent1

download_folder=staging
completed_folder=/srv/media
max_simultaneous_file_to_download=3
enable_video_compression=1
compression_ratio=99
disk_space_limit_percentage=15

[groups]
archive=My Archive Channel
public=Public Dumps
";

    #[test]
    fn parses_sections_defaults_and_clamps() {
        let root = Path::new("/etc/vidvault");
        let config = Config::parse(SAMPLE, root).unwrap();
        assert_eq!(config.api_id, "12345");
        assert_eq!(config.download_folder, PathBuf::from("/etc/vidvault/staging"));
        assert_eq!(config.completed_folder, PathBuf::from("/srv/media"));
        assert_eq!(config.max_simultaneous_downloads, 3);
        assert!(config.enable_video_compression);
        assert_eq!(config.compression_ratio, 51); // clamped
        assert_eq!(config.disk_space_limit_percentage, 15);
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups["archive"], "My Archive Channel");
        // untouched keys keep defaults
        assert_eq!(config.compression_min_size_mb, DEFAULT_COMPRESSION_MIN_SIZE_MB);
        assert!(!config.disabled);
    }

    #[test]
    fn rejects_malformed_lines() {
        let err = Config::parse("not a pair", Path::new("/")).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 1, .. }));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err =
            Config::parse("max_simultaneous_file_to_download=0", Path::new("/")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = Config::parse("future_flag=1", Path::new("/")).unwrap();
        assert_eq!(config.max_simultaneous_downloads, DEFAULT_MAX_SIMULTANEOUS);
    }

    #[test]
    fn summary_redacts_secrets() {
        let config = Config::parse(SAMPLE, Path::new("/")).unwrap();
        let summary = config.redacted_summary();
        assert!(summary.contains("api_id=12345"));
        assert!(!summary.contains("deadbeef"));
        assert!(!summary.contains("+1555000"));
    }
}
