use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Rooms are referenced by id only. Name, kind and capacity live with
/// whoever manages rooms; admission never reads them.
pub type RoomId = Ulid;
pub type BookingId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Build a span without checking `start < end`. Requests are checked by
    /// `engine::validate_span` before any span reaches the detector.
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
        }
    }

    /// Rejected bookings are inert: they never block a room.
    pub fn blocks(&self) -> bool {
        !matches!(self, BookingStatus::Rejected)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "rejected" => Ok(BookingStatus::Rejected),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub requester: String,
    pub purpose: String,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn pending(
        id: BookingId,
        room_id: RoomId,
        requester: String,
        purpose: String,
        span: Span,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            room_id,
            requester,
            purpose,
            span,
            status: BookingStatus::Pending,
            created_at,
        }
    }

    /// True if this booking would block `span` on the same room.
    pub fn blocks(&self, span: &Span) -> bool {
        self.status.blocks() && self.span.overlaps(span)
    }
}

/// Journal record format — flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: BookingId,
        room_id: RoomId,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: BookingId,
        room_id: RoomId,
        span: Span,
    },
    BookingDeleted {
        id: BookingId,
        room_id: RoomId,
    },
}

impl Event {
    pub fn room_id(&self) -> RoomId {
        match self {
            Event::BookingCreated { booking } => booking.room_id,
            Event::BookingStatusChanged { room_id, .. }
            | Event::BookingRescheduled { room_id, .. }
            | Event::BookingDeleted { room_id, .. } => *room_id,
        }
    }
}
