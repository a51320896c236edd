use crate::model::*;
use crate::store::BookingStore;

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError};

impl<S: BookingStore> Engine<S> {
    pub async fn get(&self, id: BookingId) -> Result<Booking, EngineError> {
        self.store
            .get_booking(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn list(&self, room_id: Option<RoomId>) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.list_bookings(room_id).await?)
    }

    /// Bookings that a `create` for `span` in `room_id` would collide with.
    /// Advisory only: nothing is locked, so the answer can be stale by the
    /// time a booking is requested.
    pub async fn check_schedule(&self, room_id: RoomId, span: Span) -> Result<Vec<Booking>, EngineError> {
        validate_span(&span, now_ms(), &self.policy)?;
        let mut hits = self.store.fetch_overlapping(room_id, span).await?;
        hits.retain(|b| b.room_id == room_id && b.blocks(&span));
        hits.sort_by_key(|b| (b.span.start, b.id));
        Ok(hits)
    }
}
