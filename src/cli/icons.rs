//! Styled status markers for command output.

use console::{style, StyledObject};

use crate::model::Outcome;

pub fn success() -> StyledObject<&'static str> {
    style("✓").green()
}

/// Start of a long-running step.
pub fn info() -> StyledObject<&'static str> {
    style("→").cyan()
}

pub fn warn() -> StyledObject<&'static str> {
    style("!").yellow()
}

pub fn error() -> StyledObject<&'static str> {
    style("✗").red()
}

/// Secondary detail line under a heading.
pub fn dim_arrow() -> StyledObject<&'static str> {
    style("→").dim()
}

/// Marker for a per-row outcome in the run summary.
pub fn outcome(outcome: Outcome) -> StyledObject<&'static str> {
    match outcome {
        Outcome::Resolved => success(),
        Outcome::Partial => style("◐").yellow(),
        Outcome::NotFound => style("·").dim(),
        Outcome::Blocked => warn(),
        Outcome::Error => error(),
    }
}
