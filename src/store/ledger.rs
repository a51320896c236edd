use crate::model::*;

/// All bookings of one room, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomLedger {
    pub room_id: RoomId,
    bookings: Vec<Booking>,
}

impl RoomLedger {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            bookings: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn get(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn get_mut(&mut self, id: &BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Insert keeping start order.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: &BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == *id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings whose span intersects `window`, any status.
    /// Everything at or past the partition point starts at or after `window.end`.
    pub fn overlapping(&self, window: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < window.end);
        let start = window.start;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > start)
    }
}
