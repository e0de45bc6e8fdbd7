//! Rule engine: pattern-driven renaming and destination-folder derivation.
//!
//! Rules are loaded from `*.rule` files in a configured directory, sorted
//! by scope specificity, and applied first-match-wins. A rule remembers
//! which artifacts it rewrote (the bound set) so folder derivation can find
//! the owning rule later, including across reloads.

mod engine;
mod parser;
mod template;

pub use engine::{RuleContext, RuleEngine};
pub use parser::{Rule, RuleId, RuleScope};
pub use template::{expand_folder_mask, format_positional, validate_template, TemplateError};

use thiserror::Error;

/// Why a rule file failed to load. Invalid files are logged and skipped;
/// they never abort a directory scan.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("cannot read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing `on:message:pattern` directive")]
    MissingPattern,

    #[error("missing `action:message:translate` directive")]
    MissingTranslate,

    #[error("`{directive}` requires `{requires}` earlier in the file")]
    OutOfOrder {
        directive: &'static str,
        requires: &'static str,
    },

    #[error("invalid regex in `{directive}`: {source}")]
    BadRegex {
        directive: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("unsafe template: {0}")]
    Template(#[from] TemplateError),
}
