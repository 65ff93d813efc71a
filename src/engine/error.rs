use ulid::Ulid;

use crate::model::Span;
use crate::timestamp::format_ms;

/// What kind of record a `NotFound` or `AlreadyExists` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Specialty,
    Doctor,
    Patient,
    Appointment,
    History,
    Prescription,
    Reminder,
}

impl Entity {
    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Specialty => "specialty",
            Entity::Doctor => "doctor",
            Entity::Patient => "patient",
            Entity::Appointment => "appointment",
            Entity::History => "clinical history",
            Entity::Prescription => "prescription",
            Entity::Reminder => "reminder",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// The doctor already has an active appointment intersecting `window`.
    Overlap {
        doctor_id: Ulid,
        window: Span,
        conflicting: Ulid,
        conflicting_window: Span,
    },
    NotFound(Entity, Ulid),
    /// A unique key (`what`) is already taken.
    AlreadyExists(Entity, String),
    Validation(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Overlap {
                doctor_id,
                window,
                conflicting,
                conflicting_window,
            } => write!(
                f,
                "doctor {doctor_id} already has appointment {conflicting} at [{}, {}) \
                 which overlaps the requested window [{}, {})",
                format_ms(conflicting_window.start),
                format_ms(conflicting_window.end),
                format_ms(window.start),
                format_ms(window.end),
            ),
            EngineError::NotFound(entity, id) => write!(f, "{} not found: {id}", entity.as_str()),
            EngineError::AlreadyExists(entity, what) => {
                write!(f, "{} already exists: {what}", entity.as_str())
            }
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
