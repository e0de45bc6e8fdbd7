//! Template validation and positional substitution.
//!
//! Rule actions are format strings filled from regex capture groups:
//! `{0}`/`{1}`/bare `{}` in name templates, `#0`/`#1` in folder masks.
//! Substitution is positional only; templates that stray from the accepted
//! grammar are rejected at load time so no untrusted format ever runs.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Accepted template shape: literal text with `{}`/`{N}` holes only.
static SAFE_TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^{]*(\{[^{}]*\}|\{\}|[^{]*)*[^{]*$").unwrap());

/// Template rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template does not match the accepted grammar: {0:?}")]
    Unsafe(String),

    #[error("unbalanced braces in template: {0:?}")]
    Unbalanced(String),

    #[error("placeholder {{{0}}} is not a position")]
    NotPositional(String),

    #[error("placeholder {{{index}}} exceeds the {available} capture group(s)")]
    OutOfRange { index: usize, available: usize },
}

/// Validate a name template at load time.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    if !SAFE_TEMPLATE.is_match(template) {
        return Err(TemplateError::Unsafe(template.to_string()));
    }
    // The grammar is permissive about nesting; walk the braces too.
    let mut depth = 0u32;
    for ch in template.chars() {
        match ch {
            '{' => {
                depth += 1;
                if depth > 1 {
                    return Err(TemplateError::Unsafe(template.to_string()));
                }
            }
            '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| TemplateError::Unbalanced(template.to_string()))?;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(TemplateError::Unbalanced(template.to_string()));
    }
    Ok(())
}

/// Fill `{}`/`{N}` holes from capture groups.
///
/// `{0}` is the first capture group; bare `{}` consumes groups left to
/// right, matching the source language's positional formatting.
pub fn format_positional(template: &str, groups: &[&str]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_sequential = 0usize;

    while let Some(ch) = chars.next() {
        if ch != '{' {
            if ch == '}' {
                return Err(TemplateError::Unbalanced(template.to_string()));
            }
            out.push(ch);
            continue;
        }
        let mut body = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => body.push(c),
                None => return Err(TemplateError::Unbalanced(template.to_string())),
            }
        }
        let index = if body.is_empty() {
            let index = next_sequential;
            next_sequential += 1;
            index
        } else {
            body.parse::<usize>()
                .map_err(|_| TemplateError::NotPositional(body.clone()))?
        };
        let value = groups.get(index).ok_or(TemplateError::OutOfRange {
            index,
            available: groups.len(),
        })?;
        out.push_str(value);
    }
    Ok(out)
}

/// Fill `#0`/`#1` holes of a folder mask from capture groups, trimming each
/// substituted value.
#[must_use]
pub fn expand_folder_mask(mask: &str, groups: &[&str]) -> String {
    let mut out = mask.to_string();
    for (index, value) in groups.iter().enumerate() {
        out = out.replace(&format!("#{index}"), value.trim());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_positional_templates() {
        validate_template("E{0}").unwrap();
        validate_template("Season {0} Episode {1}").unwrap();
        validate_template("{} - {}").unwrap();
        validate_template("no holes at all").unwrap();
    }

    #[test]
    fn rejects_nested_and_unbalanced_braces() {
        assert!(validate_template("{{0}}").is_err());
        assert!(validate_template("open {0").is_err());
        assert!(validate_template("stray } brace").is_err());
    }

    #[test]
    fn positional_substitution() {
        assert_eq!(format_positional("E{0}", &["07"]).unwrap(), "E07");
        assert_eq!(
            format_positional("{1} then {0}", &["a", "b"]).unwrap(),
            "b then a"
        );
        assert_eq!(format_positional("{} {}", &["x", "y"]).unwrap(), "x y");
    }

    #[test]
    fn out_of_range_placeholder_fails() {
        let err = format_positional("E{3}", &["07"]).unwrap_err();
        assert_eq!(
            err,
            TemplateError::OutOfRange {
                index: 3,
                available: 1
            }
        );
    }

    #[test]
    fn named_placeholder_fails() {
        assert!(matches!(
            format_positional("{name}", &["x"]),
            Err(TemplateError::NotPositional(_))
        ));
    }

    #[test]
    fn folder_mask_expansion_trims() {
        assert_eq!(
            expand_folder_mask("/media/#0/#1", &[" Show ", "S01"]),
            "/media/Show/S01"
        );
        assert_eq!(expand_folder_mask("/flat", &["x"]), "/flat");
    }
}
