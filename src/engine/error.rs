use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Missing or malformed input; rejected before any I/O.
    Validation(String),
    NotFound(&'static str, String),
    AlreadyExists(Ulid),
    /// The requested interval collides with a confirmed reservation (`Some`)
    /// or an external calendar event (`None`).
    SlotTaken(Option<Ulid>),
    AlreadyCancelled,
    TooLate { notice_ms: Ms },
    InvalidTransition(&'static str),
    CalendarUnavailable(String),
    LimitExceeded(&'static str),
    /// Durable write failed. The detail is for logs, not for clients.
    Persistence(String),
}

impl EngineError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound(what, id.to_string())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotTaken(Some(id)) => {
                write!(f, "slot taken: overlaps reservation {id}")
            }
            EngineError::SlotTaken(None) => {
                write!(f, "slot taken: overlaps a calendar event")
            }
            EngineError::AlreadyCancelled => write!(f, "reservation already cancelled"),
            EngineError::TooLate { notice_ms } => write!(
                f,
                "too late to cancel: at least {}h notice required",
                notice_ms / crate::model::HOUR_MS
            ),
            EngineError::InvalidTransition(state) => {
                write!(f, "reservation is {state} and can no longer change")
            }
            EngineError::CalendarUnavailable(e) => {
                write!(f, "external calendar unavailable: {e}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Persistence(e) => write!(f, "persistence failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<crate::model::TransitionError> for EngineError {
    fn from(e: crate::model::TransitionError) -> Self {
        match e {
            crate::model::TransitionError::AlreadyCancelled => EngineError::AlreadyCancelled,
            crate::model::TransitionError::Closed(state) => EngineError::InvalidTransition(state),
        }
    }
}
