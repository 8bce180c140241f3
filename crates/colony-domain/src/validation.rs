use crate::ColonyError;

pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Gate for every caller-supplied identifier that may end up in a path, a
/// process environment or a derived id.
///
/// Accepts `[A-Za-z0-9_-]{1,128}` without a leading or trailing separator.
/// Traversal sequences and shell metacharacters fail the character check.
///
/// # Errors
/// Returns [`ColonyError::Validation`] naming the offending field.
pub fn validate_identifier(field_name: &str, value: &str) -> Result<(), ColonyError> {
    if value.is_empty() {
        return Err(ColonyError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ColonyError::Validation(format!(
            "{field_name} exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }

    if let Some(bad) = value
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_'))
    {
        return Err(ColonyError::Validation(format!(
            "{field_name} contains forbidden character {bad:?}"
        )));
    }

    let is_separator = |ch: char| ch == '-' || ch == '_';
    if value.starts_with(is_separator) || value.ends_with(is_separator) {
        return Err(ColonyError::Validation(format!(
            "{field_name} MUST NOT start or end with a separator"
        )));
    }

    Ok(())
}

/// # Errors
/// Returns [`ColonyError::Validation`] when a present value is invalid.
pub fn validate_optional_identifier(
    field_name: &str,
    value: Option<&str>,
) -> Result<(), ColonyError> {
    match value {
        Some(value) => validate_identifier(field_name, value),
        None => Ok(()),
    }
}

/// # Errors
/// Returns [`ColonyError::Validation`] when the value is NaN or outside `[0.0, 1.0]`.
pub fn validate_unit_interval(field_name: &str, value: f64) -> Result<(), ColonyError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ColonyError::Validation(format!(
            "{field_name} MUST be in [0.0, 1.0], got {value}"
        )));
    }
    Ok(())
}
