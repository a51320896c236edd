mod journal;
mod ledger;
mod ledger_store;

pub use ledger::RoomLedger;
pub use ledger_store::LedgerStore;

use async_trait::async_trait;

use crate::model::*;

/// Failures reported by a booking store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(BookingId),
    DuplicateId(BookingId),
    /// The write would overlap a live booking in the same room.
    ConstraintViolation {
        room_id: RoomId,
        conflicting: BookingId,
    },
    /// Compare-and-swap on status lost: the booking is no longer in the expected state.
    StateMismatch {
        id: BookingId,
        actual: BookingStatus,
    },
    LimitExceeded(&'static str),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "booking not found: {id}"),
            StoreError::DuplicateId(id) => write!(f, "booking already exists: {id}"),
            StoreError::ConstraintViolation { room_id, conflicting } => {
                write!(f, "room {room_id}: overlaps booking {conflicting}")
            }
            StoreError::StateMismatch { id, actual } => {
                write!(f, "booking {id} is {actual}")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Read/write capabilities the booking engine needs from persistence.
///
/// Implementations must make each call atomic with respect to the single
/// booking or room it touches. Cross-call atomicity (check-then-write) is the
/// engine's job.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Every non-deleted booking recorded for the room, any status.
    async fn fetch_active_bookings(&self, room_id: RoomId) -> Result<Vec<Booking>, StoreError>;

    /// Non-deleted bookings for the room whose span intersects `window`.
    async fn fetch_overlapping(
        &self,
        room_id: RoomId,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut bookings = self.fetch_active_bookings(room_id).await?;
        bookings.retain(|b| b.span.overlaps(&window));
        Ok(bookings)
    }

    async fn persist_new_booking(&self, booking: Booking) -> Result<Booking, StoreError>;

    /// Set `new` only if the booking is currently `expected`.
    async fn update_booking_status(
        &self,
        id: BookingId,
        expected: BookingStatus,
        new: BookingStatus,
    ) -> Result<Booking, StoreError>;

    async fn reschedule_booking(&self, id: BookingId, span: Span) -> Result<Booking, StoreError>;

    async fn delete_booking(&self, id: BookingId) -> Result<Booking, StoreError>;

    async fn get_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Bookings ordered by start time; all rooms when `room_id` is `None`.
    async fn list_bookings(&self, room_id: Option<RoomId>) -> Result<Vec<Booking>, StoreError>;
}
