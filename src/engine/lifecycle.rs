use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{BOOKINGS_ADMITTED_TOTAL, BOOKING_CONFLICTS_TOTAL, BOOKING_TRANSITIONS_TOTAL};
use crate::store::BookingStore;

use super::conflict::{find_conflict, now_ms, validate_request_text, validate_span};
use super::{Engine, EngineError};

fn count_conflict<T>(result: &Result<T, EngineError>) {
    if let Err(EngineError::Conflict { .. }) = result {
        metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
    }
}

impl<S: BookingStore> Engine<S> {
    /// Admit a new booking in `pending` state under a fresh id.
    pub async fn create(
        &self,
        room_id: RoomId,
        span: Span,
        requester: String,
        purpose: String,
    ) -> Result<Booking, EngineError> {
        self.create_with_id(Ulid::new(), room_id, span, requester, purpose)
            .await
    }

    /// Admit a new booking with a caller-chosen id.
    ///
    /// Fails with `Conflict` if any pending or approved booking of the room
    /// overlaps `span`; nothing is written in that case.
    pub async fn create_with_id(
        &self,
        id: BookingId,
        room_id: RoomId,
        span: Span,
        requester: String,
        purpose: String,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        validate_span(&span, now, &self.policy)?;
        validate_request_text(&requester, &purpose)?;

        let _room = self.lock_room(room_id).await;
        let result = self.admit(id, room_id, span, requester, purpose, now).await;
        count_conflict(&result);
        match &result {
            Ok(booking) => {
                metrics::counter!(BOOKINGS_ADMITTED_TOTAL).increment(1);
                debug!("admitted booking {} in room {room_id} for {span}", booking.id);
            }
            Err(e) => debug!("refused booking {id} in room {room_id} for {span}: {e}"),
        }
        result
    }

    /// Check-then-write. The caller holds the room lock.
    async fn admit(
        &self,
        id: BookingId,
        room_id: RoomId,
        span: Span,
        requester: String,
        purpose: String,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let existing = self.store.fetch_active_bookings(room_id).await?;
        if let Some(conflict) = find_conflict(room_id, &span, &existing) {
            return Err(EngineError::Conflict {
                room_id,
                with: conflict.id,
            });
        }
        let booking = Booking::pending(id, room_id, requester, purpose, span, now);
        Ok(self.store.persist_new_booking(booking).await?)
    }

    pub async fn approve(&self, id: BookingId) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Approved).await
    }

    pub async fn reject(&self, id: BookingId) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Rejected).await
    }

    /// pending → `target`. Anything else is `InvalidState`, including losing a
    /// race with a concurrent transition. Conflicts are not re-checked.
    async fn transition(&self, id: BookingId, target: BookingStatus) -> Result<Booking, EngineError> {
        let current = self
            .store
            .get_booking(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
            });
        }

        let updated = self
            .store
            .update_booking_status(id, BookingStatus::Pending, target)
            .await?;
        metrics::counter!(BOOKING_TRANSITIONS_TOTAL, "status" => target.as_str()).increment(1);
        info!("booking {id} in room {} is now {target}", updated.room_id);
        Ok(updated)
    }

    /// Move a pending booking to a new span in the same room.
    pub async fn reschedule(&self, id: BookingId, span: Span) -> Result<Booking, EngineError> {
        validate_span(&span, now_ms(), &self.policy)?;
        let room_id = self
            .store
            .get_booking(id)
            .await?
            .ok_or(EngineError::NotFound(id))?
            .room_id;

        let _room = self.lock_room(room_id).await;
        // Re-read: the booking may have changed while we waited for the lock.
        let current = self
            .store
            .get_booking(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if current.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id,
                status: current.status,
            });
        }

        let existing = self.store.fetch_active_bookings(room_id).await?;
        let result = match find_conflict(room_id, &span, existing.iter().filter(|b| b.id != id)) {
            Some(conflict) => Err(EngineError::Conflict {
                room_id,
                with: conflict.id,
            }),
            None => self
                .store
                .reschedule_booking(id, span)
                .await
                .map_err(EngineError::from),
        };
        count_conflict(&result);
        result
    }

    /// Remove a booking in any state; its span is free afterwards.
    pub async fn delete(&self, id: BookingId) -> Result<Booking, EngineError> {
        let room_id = self
            .store
            .get_booking(id)
            .await?
            .ok_or(EngineError::NotFound(id))?
            .room_id;
        let _room = self.lock_room(room_id).await;
        let removed = self.store.delete_booking(id).await?;
        info!("deleted booking {id} from room {room_id}");
        Ok(removed)
    }
}
