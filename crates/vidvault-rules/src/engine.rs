//! Rule evaluation and the bound-artifact registry.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::parser::{Rule, RuleId};
use crate::template::{expand_folder_mask, format_positional};

/// Job-side fields a rule's scope filters are checked against.
#[derive(Debug, Clone, Default)]
pub struct RuleContext<'a> {
    pub chat_id: Option<i64>,
    pub chat_username: Option<&'a str>,
    pub chat_title: Option<&'a str>,
    /// The job's file basename, for `use:message:filename` rules.
    pub file_name: &'a str,
    /// The artifact the winning rule gets bound to.
    pub artifact_id: i64,
}

/// Loaded rules plus the rule → artifacts ownership map.
///
/// The bound map survives [`RuleEngine::reload`] so running jobs keep their
/// derived folders while the operator edits rule files.
pub struct RuleEngine {
    dir: PathBuf,
    rules: Vec<Rule>,
    bound: HashMap<RuleId, HashSet<i64>>,
}

impl RuleEngine {
    /// Scan `dir` for `*.rule` files. Invalid files are logged and skipped;
    /// a missing directory yields an empty engine.
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        let mut engine = Self {
            dir: dir.to_path_buf(),
            rules: Vec::new(),
            bound: HashMap::new(),
        };
        engine.reload();
        engine
    }

    /// Re-scan the rules directory, preserving the bound map.
    pub fn reload(&mut self) {
        let mut rules = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "rules directory not readable");
                self.rules = rules;
                return;
            }
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "rule") {
                continue;
            }
            match std::fs::read_to_string(&path).map_err(crate::RuleError::Io) {
                Ok(text) => match Rule::parse(&path, &text) {
                    Ok(rule) => rules.push(rule),
                    Err(e) => {
                        tracing::warn!(rule = %path.display(), error = %e, "skipping invalid rule");
                    }
                },
                Err(e) => {
                    tracing::warn!(rule = %path.display(), error = %e, "skipping unreadable rule");
                }
            }
        }
        rules.sort_by(|a, b| {
            a.scope
                .specificity_cmp(&b.scope)
                .then_with(|| a.source_path.cmp(&b.source_path))
        });
        tracing::debug!(count = rules.len(), dir = %self.dir.display(), "rules loaded");
        self.rules = rules;
    }

    /// The rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Directory the engine scans.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rewrite a display name through the first matching rule.
    ///
    /// Returns the rewritten string, or `None` when no rule matches. On a
    /// match the artifact is recorded in the winning rule's bound set, which
    /// is what later lets [`Self::apply_folder`] find the same rule.
    pub fn apply_translate(&mut self, input: &str, ctx: &RuleContext<'_>) -> Option<String> {
        for rule in &self.rules {
            if !scope_matches(rule, ctx) {
                continue;
            }
            let subject = if rule.use_filename { ctx.file_name } else { input };
            let Some(captures) = rule.match_pattern.captures(subject) else {
                continue;
            };
            let groups: Vec<&str> = (1..captures.len())
                .map(|i| captures.get(i).map_or("", |m| m.as_str()))
                .collect();
            match format_positional(&rule.name_template, &groups) {
                Ok(rewritten) => {
                    self.bound.entry(rule.id).or_default().insert(ctx.artifact_id);
                    tracing::debug!(
                        rule = %rule.id,
                        artifact = ctx.artifact_id,
                        from = input,
                        to = %rewritten,
                        "rule translated name"
                    );
                    return Some(rewritten);
                }
                Err(e) => {
                    tracing::warn!(rule = %rule.id, error = %e, "translate failed, rule skipped");
                    return None;
                }
            }
        }
        None
    }

    /// Derive the completed folder for an artifact bound earlier.
    ///
    /// Applies the owning rule's folder pattern to `input` and expands the
    /// folder mask from its capture groups. `None` when no rule owns the
    /// artifact, the rule has no folder action, or the pattern misses.
    #[must_use]
    pub fn apply_folder(&self, input: &str, artifact_id: i64) -> Option<String> {
        let rule = self.rules.iter().find(|rule| {
            self.bound
                .get(&rule.id)
                .is_some_and(|artifacts| artifacts.contains(&artifact_id))
        })?;
        let mask = rule.folder_template.as_deref()?;
        let pattern = rule.folder_pattern.as_ref()?;
        let captures = pattern.captures(input)?;
        let groups: Vec<&str> = (1..captures.len())
            .map(|i| captures.get(i).map_or("", |m| m.as_str()))
            .collect();
        Some(expand_folder_mask(mask, &groups))
    }

    /// Artifacts currently bound to a rule.
    #[must_use]
    pub fn bound_artifacts(&self, id: RuleId) -> Option<&HashSet<i64>> {
        self.bound.get(&id)
    }

    /// Write a new rule file and reload. The contents are validated first;
    /// an invalid rule is reported and nothing is written.
    pub fn add_rule_file(&mut self, name: &str, contents: &str) -> Result<PathBuf, crate::RuleError> {
        let file_name = if name.ends_with(".rule") {
            name.to_string()
        } else {
            format!("{name}.rule")
        };
        let path = self.dir.join(file_name);
        Rule::parse(&path, contents)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, contents)?;
        self.reload();
        Ok(path)
    }

    /// Overwrite an existing rule file and reload.
    pub fn edit_rule_file(&mut self, path: &Path, contents: &str) -> Result<(), crate::RuleError> {
        Rule::parse(path, contents)?;
        std::fs::write(path, contents)?;
        self.reload();
        Ok(())
    }

    /// Retire a rule file by renaming it to `<name>.deleted`, then reload.
    pub fn delete_rule_file(&mut self, path: &Path) -> Result<(), crate::RuleError> {
        let mut retired = path.as_os_str().to_owned();
        retired.push(".deleted");
        std::fs::rename(path, PathBuf::from(retired))?;
        self.reload();
        Ok(())
    }
}

fn scope_matches(rule: &Rule, ctx: &RuleContext<'_>) -> bool {
    if let Some(id) = rule.scope.chat_id {
        if ctx.chat_id != Some(id) {
            return false;
        }
    }
    if let Some(ref username) = rule.scope.chat_username {
        if ctx.chat_username != Some(username.as_str()) {
            return false;
        }
    }
    if let Some(ref title) = rule.scope.chat_title {
        if ctx.chat_title != Some(title.as_str()) {
            return false;
        }
    }
    true
}
