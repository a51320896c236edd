use crate::limits::*;
use crate::model::*;

use super::{AdmissionPolicy, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// First booking of `room_id` in `existing` that blocks `candidate`.
///
/// Half-open overlap; rejected bookings and bookings of other rooms never
/// match. Callers re-checking a booking that is already recorded must filter
/// its own id out of `existing`.
pub fn find_conflict<'a, I>(room_id: RoomId, candidate: &Span, existing: I) -> Option<&'a Booking>
where
    I: IntoIterator<Item = &'a Booking>,
{
    existing
        .into_iter()
        .find(|b| b.room_id == room_id && b.blocks(candidate))
}

pub fn has_conflict(room_id: RoomId, candidate: &Span, existing: &[Booking]) -> bool {
    find_conflict(room_id, candidate, existing).is_some()
}

pub(crate) fn validate_span(span: &Span, now: Ms, policy: &AdmissionPolicy) -> Result<(), EngineError> {
    if span.is_empty() {
        return Err(EngineError::Validation(format!(
            "start must be before end, got {span}"
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    if policy.reject_past && span.start < now {
        return Err(EngineError::Validation(format!(
            "span {span} starts in the past"
        )));
    }
    Ok(())
}

pub(crate) fn validate_request_text(requester: &str, purpose: &str) -> Result<(), EngineError> {
    if requester.trim().is_empty() {
        return Err(EngineError::Validation("requester is required".into()));
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::LimitExceeded("requester too long"));
    }
    if purpose.len() > MAX_PURPOSE_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    Ok(())
}
