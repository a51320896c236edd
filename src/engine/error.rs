use crate::model::{BookingId, BookingStatus, RoomId};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed request; never reaches the store.
    Validation(String),
    Conflict {
        room_id: RoomId,
        with: BookingId,
    },
    NotFound(BookingId),
    /// Transition attempted from a non-pending state.
    InvalidState {
        id: BookingId,
        status: BookingStatus,
    },
    AlreadyExists(BookingId),
    LimitExceeded(&'static str),
    StorageUnavailable(String),
}

impl EngineError {
    /// Short, stable name for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict { room_id, with } => {
                write!(f, "schedule conflict in room {room_id} with booking {with}")
            }
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "booking {id} is already {status}")
            }
            EngineError::AlreadyExists(id) => write!(f, "booking already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::DuplicateId(id) => EngineError::AlreadyExists(id),
            StoreError::ConstraintViolation { room_id, conflicting } => EngineError::Conflict {
                room_id,
                with: conflicting,
            },
            StoreError::StateMismatch { id, actual } => EngineError::InvalidState { id, status: actual },
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::Unavailable(e) => EngineError::StorageUnavailable(e),
        }
    }
}
