//! Line-oriented rule DSL.
//!
//! One rule per file. Lines starting with `#` are comments; every directive
//! carries its value as `directive="value"`. Order matters twice:
//! `on:folder:pattern` is only accepted after `on:message:pattern`, and
//! `action:folder:completed` only after `on:folder:pattern`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::template::validate_template;
use crate::RuleError;

static DIRECTIVE_VALUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"="(.*?)""#).unwrap());

/// Stable rule identity: a hash of the source path, so ids survive reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u64);

impl RuleId {
    /// FNV-1a over the path string.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in path.to_string_lossy().as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Self(hash)
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Scope filters; every provided filter must equal the job's field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleScope {
    pub chat_id: Option<i64>,
    pub chat_username: Option<String>,
    pub chat_title: Option<String>,
}

impl RuleScope {
    /// Sort key: more specific scopes first, descending field values, `None`
    /// last; deterministic regardless of directory-scan order.
    #[must_use]
    pub fn specificity_cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn desc_none_last<T: Ord>(a: Option<&T>, b: Option<&T>) -> std::cmp::Ordering {
            match (a, b) {
                (Some(x), Some(y)) => y.cmp(x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        }
        desc_none_last(self.chat_id.as_ref(), other.chat_id.as_ref())
            .then_with(|| {
                desc_none_last(self.chat_username.as_ref(), other.chat_username.as_ref())
            })
            .then_with(|| desc_none_last(self.chat_title.as_ref(), other.chat_title.as_ref()))
    }
}

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub source_path: PathBuf,
    /// Regex over the display-name (or filename) input; anchored at start.
    pub match_pattern: Regex,
    /// Regex feeding `#N` capture groups of the folder mask.
    pub folder_pattern: Option<Regex>,
    pub scope: RuleScope,
    /// Evaluate against the job's file basename instead of its display name.
    pub use_filename: bool,
    pub name_template: String,
    pub folder_template: Option<String>,
}

impl Rule {
    /// Parse one rule file's text.
    pub fn parse(source_path: &Path, text: &str) -> Result<Self, RuleError> {
        let mut match_raw: Option<String> = None;
        let mut folder_raw: Option<String> = None;
        let mut scope = RuleScope::default();
        let mut use_filename = false;
        let mut name_template: Option<String> = None;
        let mut folder_template: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(value) = directive_value(line) else {
                continue;
            };

            if line.starts_with("on:message:pattern") {
                match_raw = Some(value);
            } else if line.starts_with("on:folder:pattern") {
                if match_raw.is_none() {
                    return Err(RuleError::OutOfOrder {
                        directive: "on:folder:pattern",
                        requires: "on:message:pattern",
                    });
                }
                folder_raw = Some(value);
            } else if line.starts_with("set:chat:id") {
                scope.chat_id = value.parse().ok();
            } else if line.starts_with("set:chat:title") {
                scope.chat_title = Some(value);
            } else if line.starts_with("set:chat:name") {
                scope.chat_username = Some(value);
            } else if line.starts_with("use:message:filename") {
                use_filename = !value.is_empty();
            } else if line.starts_with("action:message:translate") {
                name_template = Some(value);
            } else if line.starts_with("action:folder:completed") {
                if folder_raw.is_none() {
                    return Err(RuleError::OutOfOrder {
                        directive: "action:folder:completed",
                        requires: "on:folder:pattern",
                    });
                }
                folder_template = Some(value);
            }
        }

        let match_raw = match_raw.ok_or(RuleError::MissingPattern)?;
        let name_template = name_template.ok_or(RuleError::MissingTranslate)?;
        validate_template(&name_template)?;

        let match_pattern = anchor(&match_raw).map_err(|source| RuleError::BadRegex {
            directive: "on:message:pattern",
            source,
        })?;
        let folder_pattern = folder_raw
            .as_deref()
            .map(anchor)
            .transpose()
            .map_err(|source| RuleError::BadRegex {
                directive: "on:folder:pattern",
                source,
            })?;

        Ok(Self {
            id: RuleId::from_path(source_path),
            source_path: source_path.to_path_buf(),
            match_pattern,
            folder_pattern,
            scope,
            use_filename,
            name_template,
            folder_template,
        })
    }
}

/// Extract the `="value"` payload of a directive line.
fn directive_value(line: &str) -> Option<String> {
    DIRECTIVE_VALUE
        .captures(line)
        .map(|c| c[1].to_string())
}

/// Patterns match from the start of the input, like the DSL always has.
fn anchor(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPISODE_RULE: &str = r#"
# episode renamer
on:message:pattern=".*Episode (\d+).*"
on:folder:pattern="Series-(.+)"
set:chat:name="public"
action:message:translate="E{0}"
action:folder:completed="/media/#0"
"#;

    #[test]
    fn parses_all_directives() {
        let rule = Rule::parse(Path::new("/rules/episode.rule"), EPISODE_RULE).unwrap();
        assert_eq!(rule.name_template, "E{0}");
        assert_eq!(rule.folder_template.as_deref(), Some("/media/#0"));
        assert_eq!(rule.scope.chat_username.as_deref(), Some("public"));
        assert!(rule.folder_pattern.is_some());
        assert!(!rule.use_filename);
        assert!(rule.match_pattern.is_match("Show Episode 07"));
    }

    #[test]
    fn folder_pattern_requires_message_pattern_first() {
        let text = "on:folder:pattern=\"x\"\naction:message:translate=\"y\"\n";
        assert!(matches!(
            Rule::parse(Path::new("/r.rule"), text),
            Err(RuleError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn folder_action_requires_folder_pattern() {
        let text = "on:message:pattern=\"x\"\naction:folder:completed=\"/y\"\naction:message:translate=\"z\"\n";
        assert!(matches!(
            Rule::parse(Path::new("/r.rule"), text),
            Err(RuleError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn unsafe_template_rejected_at_parse() {
        let text = "on:message:pattern=\".*\"\naction:message:translate=\"{{evil}}\"\n";
        assert!(matches!(
            Rule::parse(Path::new("/r.rule"), text),
            Err(RuleError::Template(_))
        ));
    }

    #[test]
    fn missing_pattern_rejected() {
        assert!(matches!(
            Rule::parse(Path::new("/r.rule"), "action:message:translate=\"x\"\n"),
            Err(RuleError::MissingPattern)
        ));
    }

    #[test]
    fn match_is_anchored_at_start() {
        let text = "on:message:pattern=\"tail\"\naction:message:translate=\"x\"\n";
        let rule = Rule::parse(Path::new("/r.rule"), text).unwrap();
        assert!(rule.match_pattern.is_match("tail of something"));
        assert!(!rule.match_pattern.is_match("has tail inside"));
    }

    #[test]
    fn rule_id_is_stable_per_path() {
        let a = RuleId::from_path(Path::new("/rules/a.rule"));
        let b = RuleId::from_path(Path::new("/rules/a.rule"));
        let c = RuleId::from_path(Path::new("/rules/c.rule"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn specificity_ordering() {
        let by_id = RuleScope {
            chat_id: Some(5),
            ..RuleScope::default()
        };
        let by_name = RuleScope {
            chat_username: Some("public".into()),
            ..RuleScope::default()
        };
        let catch_all = RuleScope::default();
        assert_eq!(
            by_id.specificity_cmp(&catch_all),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            by_name.specificity_cmp(&catch_all),
            std::cmp::Ordering::Less
        );
        assert_eq!(by_id.specificity_cmp(&by_name), std::cmp::Ordering::Less);
    }
}
