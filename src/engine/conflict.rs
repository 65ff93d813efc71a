use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_timestamp(field: &str, ms: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::validation(format!("{field} out of range")));
    }
    Ok(())
}

/// First active appointment in `agenda` whose own `[start, end)` intersects
/// `window`, skipping `exclude` (the candidate itself on update).
pub fn find_overlap<'a>(agenda: &'a Agenda, exclude: Option<Ulid>, window: &Span) -> Option<&'a Appointment> {
    agenda
        .overlapping(window)
        .filter(|a| Some(a.id) != exclude)
        .find(|a| a.occupies_slot())
}

pub(crate) fn check_no_overlap(agenda: &Agenda, exclude: Option<Ulid>, window: &Span) -> Result<(), EngineError> {
    match find_overlap(agenda, exclude, window) {
        None => Ok(()),
        Some(existing) => {
            metrics::counter!(crate::observability::OVERLAP_REJECTIONS_TOTAL).increment(1);
            Err(EngineError::Overlap {
                doctor_id: agenda.doctor_id,
                window: *window,
                conflicting: existing.id,
                conflicting_window: existing.span(),
            })
        }
    }
}

/// Trimmed, non-empty, at most `max` bytes.
pub(crate) fn required_text(field: &str, value: &str, max: usize) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    if value.len() > max {
        return Err(EngineError::validation(format!("{field} longer than {max} characters")));
    }
    Ok(value.to_string())
}

/// Blank collapses to `None`.
pub(crate) fn optional_text(field: &str, value: Option<&str>, max: usize) -> Result<Option<String>, EngineError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => required_text(field, v, max).map(Some),
    }
}

pub(crate) fn validate_email(field: &str, value: &str) -> Result<String, EngineError> {
    let email = required_text(field, value, MAX_EMAIL_LEN)?;
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.split('.').count() >= 2
                && domain.split('.').all(|label| !label.is_empty())
        }
        None => false,
    };
    if !valid || email.chars().any(char::is_whitespace) {
        return Err(EngineError::validation(format!("{field} is not a valid email address: {email}")));
    }
    Ok(email)
}
