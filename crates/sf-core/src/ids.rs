//! Scenario and run identifiers.
//!
//! Ids and simulation keys double as directory names in the on-disk layout,
//! so both go through [`validate_segment`] before touching the filesystem.

use crate::{CoreError, CoreResult};

pub type ScenarioId = String;
pub type RunId = String;

/// Fresh random scenario id (uuid v4, hyphenated).
pub fn new_scenario_id() -> ScenarioId {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}

/// Check that `value` is usable as a single path segment.
///
/// Allowed: ASCII alphanumerics plus `-`, `_` and `.`, not starting with `.`.
pub fn validate_segment(what: &'static str, value: &str) -> CoreResult<()> {
    let invalid = |reason| {
        Err(CoreError::InvalidSegment {
            what,
            value: value.to_string(),
            reason,
        })
    };

    if value.is_empty() {
        return invalid("must not be empty");
    }
    if value.len() > 128 {
        return invalid("longer than 128 characters");
    }
    if value.starts_with('.') {
        return invalid("must not start with '.'");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("only ASCII letters, digits, '-', '_' and '.' are allowed");
    }
    Ok(())
}
