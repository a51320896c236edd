use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::engine::find_conflict;
use crate::limits::MAX_BOOKINGS_PER_ROOM;
use crate::model::*;
use crate::wal::Wal;

use super::journal::Journal;
use super::{BookingStore, RoomLedger, StoreError};

pub type SharedLedger = Arc<RwLock<RoomLedger>>;

/// In-memory booking store with an optional fsynced journal.
///
/// Every write takes the room's ledger lock, re-checks overlap against live
/// bookings in that room and journals the event before applying it, so an
/// overlapping pair can never be committed even by a caller that skipped the
/// engine.
pub struct LedgerStore {
    rooms: DashMap<RoomId, SharedLedger>,
    /// Reverse lookup: booking id → room id.
    booking_to_room: DashMap<BookingId, RoomId>,
    journal: Option<Journal>,
    /// Writers share it; compaction takes it exclusively so its snapshot
    /// never misses an event that is still in flight.
    gate: RwLock<()>,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Apply an event to a ledger (caller holds the ledger lock).
fn apply_to_ledger(ledger: &mut RoomLedger, event: &Event, index: &DashMap<BookingId, RoomId>) {
    match event {
        Event::BookingCreated { booking } => {
            index.insert(booking.id, booking.room_id);
            ledger.insert(booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = ledger.get_mut(id) {
                booking.status = *status;
            }
        }
        Event::BookingRescheduled { id, span, .. } => {
            if let Some(mut booking) = ledger.remove(id) {
                booking.span = *span;
                ledger.insert(booking);
            }
        }
        Event::BookingDeleted { id, .. } => {
            ledger.remove(id);
            index.remove(id);
        }
    }
}

impl LedgerStore {
    pub fn in_memory() -> Self {
        Self {
            rooms: DashMap::new(),
            booking_to_room: DashMap::new(),
            journal: None,
            gate: RwLock::new(()),
        }
    }

    /// Replay the journal at `path`, then keep appending to it.
    /// Spawns the journal writer, so it must run inside a tokio runtime.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let replay = Wal::replay(path)?;
        if replay.discarded_tail {
            warn!("journal {}: discarded torn or corrupt tail", path.display());
        }

        let mut store = Self::in_memory();
        // Sole owner of every ledger during replay, so try_write never contends.
        for event in &replay.events {
            let ledger = store.ledger_for_write(event.room_id());
            let mut guard = ledger
                .try_write()
                .map_err(|_| std::io::Error::other("replay: ledger unexpectedly locked"))?;
            apply_to_ledger(&mut guard, event, &store.booking_to_room);
        }
        info!(
            "journal {}: replayed {} events, {} live bookings",
            path.display(),
            replay.events.len(),
            store.booking_to_room.len()
        );

        store.journal = Some(Journal::start(Wal::open(path)?));
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_room.len()
    }

    fn ledger(&self, room_id: &RoomId) -> Option<SharedLedger> {
        self.rooms.get(room_id).map(|e| e.value().clone())
    }

    fn ledger_for_write(&self, room_id: RoomId) -> SharedLedger {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomLedger::new(room_id))))
            .clone()
    }

    /// Journal (when durable) then apply. The caller holds the ledger write lock.
    async fn commit(&self, ledger: &mut RoomLedger, event: &Event) -> Result<(), StoreError> {
        if let Some(journal) = &self.journal {
            journal.append(event).await?;
        }
        apply_to_ledger(ledger, event, &self.booking_to_room);
        Ok(())
    }

    /// Lookup booking → room, then take that room's write lock.
    async fn resolve_write(
        &self,
        id: &BookingId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomLedger>, StoreError> {
        let room_id = self
            .booking_to_room
            .get(id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(*id))?;
        let ledger = self.ledger(&room_id).ok_or(StoreError::NotFound(*id))?;
        Ok(ledger.write_owned().await)
    }

    /// Rewrite the journal as one `BookingCreated` per live booking.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let _exclusive = self.gate.write().await;

        let ledgers: Vec<SharedLedger> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(self.booking_to_room.len());
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(
                guard
                    .bookings()
                    .iter()
                    .map(|b| Event::BookingCreated { booking: b.clone() }),
            );
        }
        let live = events.len();
        journal.compact(events).await?;
        info!("journal compacted to {live} bookings");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        match &self.journal {
            Some(journal) => journal.appends_since_compact().await,
            None => 0,
        }
    }
}

#[async_trait]
impl BookingStore for LedgerStore {
    async fn fetch_active_bookings(&self, room_id: RoomId) -> Result<Vec<Booking>, StoreError> {
        let Some(ledger) = self.ledger(&room_id) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard.bookings().to_vec())
    }

    async fn fetch_overlapping(
        &self,
        room_id: RoomId,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(ledger) = self.ledger(&room_id) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard.overlapping(&window).cloned().collect())
    }

    async fn persist_new_booking(&self, booking: Booking) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let room_id = booking.room_id;
        let ledger = self.ledger_for_write(room_id);
        let mut guard = ledger.write().await;

        if self.booking_to_room.contains_key(&booking.id) {
            return Err(StoreError::DuplicateId(booking.id));
        }
        if guard.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(StoreError::LimitExceeded("too many bookings in room"));
        }
        if booking.status.blocks()
            && let Some(existing) =
                find_conflict(room_id, &booking.span, guard.overlapping(&booking.span))
        {
            return Err(StoreError::ConstraintViolation {
                room_id,
                conflicting: existing.id,
            });
        }

        // Claim the id before the journal await: the room lock does not cover
        // a create of the same id in another room.
        match self.booking_to_room.entry(booking.id) {
            Entry::Occupied(_) => return Err(StoreError::DuplicateId(booking.id)),
            Entry::Vacant(slot) => {
                slot.insert(room_id);
            }
        }

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        if let Err(e) = self.commit(&mut guard, &event).await {
            self.booking_to_room
                .remove_if(&booking.id, |_, claimed| *claimed == room_id);
            return Err(e);
        }
        Ok(booking)
    }

    async fn update_booking_status(
        &self,
        id: BookingId,
        expected: BookingStatus,
        new: BookingStatus,
    ) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let mut guard = self.resolve_write(&id).await?;

        let current = guard.get(&id).ok_or(StoreError::NotFound(id))?;
        if current.status != expected {
            return Err(StoreError::StateMismatch {
                id,
                actual: current.status,
            });
        }

        let room_id = guard.room_id;
        let event = Event::BookingStatusChanged {
            id,
            room_id,
            status: new,
        };
        self.commit(&mut guard, &event).await?;
        guard.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn reschedule_booking(&self, id: BookingId, span: Span) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let mut guard = self.resolve_write(&id).await?;

        let current = guard.get(&id).ok_or(StoreError::NotFound(id))?;
        let room_id = guard.room_id;
        if current.status.blocks()
            && let Some(existing) = find_conflict(
                room_id,
                &span,
                guard.overlapping(&span).filter(|b| b.id != id),
            )
        {
            return Err(StoreError::ConstraintViolation {
                room_id,
                conflicting: existing.id,
            });
        }

        let event = Event::BookingRescheduled { id, room_id, span };
        self.commit(&mut guard, &event).await?;
        guard.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn delete_booking(&self, id: BookingId) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let mut guard = self.resolve_write(&id).await?;

        let removed = guard.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        let event = Event::BookingDeleted {
            id,
            room_id: guard.room_id,
        };
        self.commit(&mut guard, &event).await?;
        Ok(removed)
    }

    async fn get_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let Some(room_id) = self.booking_to_room.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(ledger) = self.ledger(&room_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.get(&id).cloned())
    }

    async fn list_bookings(&self, room_id: Option<RoomId>) -> Result<Vec<Booking>, StoreError> {
        let ledgers: Vec<SharedLedger> = match room_id {
            Some(room_id) => self.ledger(&room_id).into_iter().collect(),
            None => self.rooms.iter().map(|e| e.value().clone()).collect(),
        };
        let mut bookings = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            bookings.extend_from_slice(guard.bookings());
        }
        bookings.sort_by_key(|b| (b.span.start, b.id));
        Ok(bookings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const DAY: Ms = 1_767_225_600_000; // 2026-01-01T00:00:00Z

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn pending(room: RoomId, start: Ms, end: Ms) -> Booking {
        Booking::pending(
            Ulid::new(),
            room,
            "staff".into(),
            "meeting".into(),
            Span::new(DAY + start, DAY + end),
            DAY,
        )
    }

    #[tokio::test]
    async fn persist_rejects_overlap_as_constraint_violation() {
        let store = LedgerStore::in_memory();
        let room = Ulid::new();
        let first = store.persist_new_booking(pending(room, 10 * H, 11 * H)).await.unwrap();

        let err = store
            .persist_new_booking(pending(room, 10 * H + H / 2, 12 * H))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::ConstraintViolation {
                room_id: room,
                conflicting: first.id
            }
        );
        assert_eq!(store.booking_count(), 1);
    }

    #[tokio::test]
    async fn persist_allows_other_rooms_and_adjacent_spans() {
        let store = LedgerStore::in_memory();
        let room = Ulid::new();
        store.persist_new_booking(pending(room, 10 * H, 11 * H)).await.unwrap();
        store.persist_new_booking(pending(room, 11 * H, 12 * H)).await.unwrap();
        store.persist_new_booking(pending(Ulid::new(), 10 * H, 11 * H)).await.unwrap();
        assert_eq!(store.booking_count(), 3);
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let store = LedgerStore::in_memory();
        let room = Ulid::new();
        let b = pending(room, 0, H);
        store.persist_new_booking(b.clone()).await.unwrap();
        let mut again = b.clone();
        again.span = Span::new(DAY + 5 * H, DAY + 6 * H);
        assert_eq!(
            store.persist_new_booking(again).await,
            Err(StoreError::DuplicateId(b.id))
        );
    }

    #[tokio::test]
    async fn status_cas_checks_expected_state() {
        let store = LedgerStore::in_memory();
        let b = store.persist_new_booking(pending(Ulid::new(), 0, H)).await.unwrap();

        let approved = store
            .update_booking_status(b.id, BookingStatus::Pending, BookingStatus::Approved)
            .await
            .unwrap();
        assert_eq!(approved.status, BookingStatus::Approved);

        let err = store
            .update_booking_status(b.id, BookingStatus::Pending, BookingStatus::Rejected)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StateMismatch {
                id: b.id,
                actual: BookingStatus::Approved
            }
        );
        let current = store.get_booking(b.id).await.unwrap().unwrap();
        assert_eq!(current.status, BookingStatus::Approved);
    }

    #[tokio::test]
    async fn unknown_booking_is_not_found() {
        let store = LedgerStore::in_memory();
        let id = Ulid::new();
        assert_eq!(store.get_booking(id).await, Ok(None));
        assert_eq!(store.delete_booking(id).await, Err(StoreError::NotFound(id)));
        assert_eq!(
            store
                .update_booking_status(id, BookingStatus::Pending, BookingStatus::Approved)
                .await,
            Err(StoreError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn rejected_booking_frees_its_span() {
        let store = LedgerStore::in_memory();
        let room = Ulid::new();
        let b = store.persist_new_booking(pending(room, 0, H)).await.unwrap();
        store
            .update_booking_status(b.id, BookingStatus::Pending, BookingStatus::Rejected)
            .await
            .unwrap();
        store.persist_new_booking(pending(room, 0, H)).await.unwrap();
        assert_eq!(store.fetch_active_bookings(room).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reschedule_excludes_itself_and_reorders() {
        let store = LedgerStore::in_memory();
        let room = Ulid::new();
        let a = store.persist_new_booking(pending(room, 0, 2 * H)).await.unwrap();
        let b = store.persist_new_booking(pending(room, 3 * H, 4 * H)).await.unwrap();

        // Overlaps its own old span only.
        let moved = store
            .reschedule_booking(a.id, Span::new(DAY + H, DAY + 3 * H))
            .await
            .unwrap();
        assert_eq!(moved.span, Span::new(DAY + H, DAY + 3 * H));

        let err = store
            .reschedule_booking(a.id, Span::new(DAY + 2 * H, DAY + 4 * H))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { conflicting, .. } if conflicting == b.id));

        store
            .reschedule_booking(a.id, Span::new(DAY + 5 * H, DAY + 6 * H))
            .await
            .unwrap();
        let listed = store.list_bookings(Some(room)).await.unwrap();
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[tokio::test]
    async fn fetch_overlapping_uses_window() {
        let store = LedgerStore::in_memory();
        let room = Ulid::new();
        store.persist_new_booking(pending(room, 0, H)).await.unwrap();
        store.persist_new_booking(pending(room, 2 * H, 3 * H)).await.unwrap();
        let hits = store
            .fetch_overlapping(room, Span::new(DAY + H / 2, DAY + 2 * H))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.fetch_overlapping(Ulid::new(), Span::new(0, DAY)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_from_index() {
        let store = LedgerStore::in_memory();
        let room = Ulid::new();
        let b = store.persist_new_booking(pending(room, 0, H)).await.unwrap();
        let removed = store.delete_booking(b.id).await.unwrap();
        assert_eq!(removed.id, b.id);
        assert_eq!(store.get_booking(b.id).await, Ok(None));
        assert_eq!(store.booking_count(), 0);
        store.persist_new_booking(pending(room, 0, H)).await.unwrap();
    }

    #[tokio::test]
    async fn list_all_rooms_sorted_by_start() {
        let store = LedgerStore::in_memory();
        store.persist_new_booking(pending(Ulid::new(), 5 * H, 6 * H)).await.unwrap();
        store.persist_new_booking(pending(Ulid::new(), H, 2 * H)).await.unwrap();
        store.persist_new_booking(pending(Ulid::new(), 3 * H, 4 * H)).await.unwrap();
        let starts: Vec<Ms> = store
            .list_bookings(None)
            .await
            .unwrap()
            .iter()
            .map(|b| b.span.start - DAY)
            .collect();
        assert_eq!(starts, vec![H, 3 * H, 5 * H]);
    }

    #[tokio::test]
    async fn journal_replay_restores_state() {
        let path = test_wal_path("replay.wal");
        let room = Ulid::new();
        let (approved, deleted, moved) = {
            let store = LedgerStore::open(&path).unwrap();
            assert!(store.is_durable());
            let approved = store.persist_new_booking(pending(room, 0, H)).await.unwrap();
            store
                .update_booking_status(approved.id, BookingStatus::Pending, BookingStatus::Approved)
                .await
                .unwrap();
            let deleted = store.persist_new_booking(pending(room, H, 2 * H)).await.unwrap();
            store.delete_booking(deleted.id).await.unwrap();
            let moved = store.persist_new_booking(pending(room, 4 * H, 5 * H)).await.unwrap();
            store
                .reschedule_booking(moved.id, Span::new(DAY + 2 * H, DAY + 3 * H))
                .await
                .unwrap();
            assert_eq!(store.appends_since_compact().await, 6);
            (approved, deleted, moved)
        };

        let reopened = LedgerStore::open(&path).unwrap();
        assert_eq!(reopened.booking_count(), 2);
        let a = reopened.get_booking(approved.id).await.unwrap().unwrap();
        assert_eq!(a.status, BookingStatus::Approved);
        assert_eq!(reopened.get_booking(deleted.id).await.unwrap(), None);
        let m = reopened.get_booking(moved.id).await.unwrap().unwrap();
        assert_eq!(m.span, Span::new(DAY + 2 * H, DAY + 3 * H));
    }

    #[tokio::test]
    async fn compaction_keeps_live_bookings_only() {
        let path = test_wal_path("compact.wal");
        let room = Ulid::new();
        let kept = {
            let store = LedgerStore::open(&path).unwrap();
            let kept = store.persist_new_booking(pending(room, 0, H)).await.unwrap();
            store
                .update_booking_status(kept.id, BookingStatus::Pending, BookingStatus::Rejected)
                .await
                .unwrap();
            for i in 1..5 {
                let b = store.persist_new_booking(pending(room, i * H, (i + 1) * H)).await.unwrap();
                store.delete_booking(b.id).await.unwrap();
            }
            assert_eq!(store.appends_since_compact().await, 10);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            kept
        };

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 1);

        let reopened = LedgerStore::open(&path).unwrap();
        let b = reopened.get_booking(kept.id).await.unwrap().unwrap();
        assert_eq!(b.status, BookingStatus::Rejected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_id_in_two_rooms_is_admitted_once_with_journal() {
        let path = test_wal_path("same_id_two_rooms.wal");
        let store = Arc::new(LedgerStore::open(&path).unwrap());

        for round in 0..50 {
            let id = Ulid::new();
            let mut handles = Vec::new();
            for _ in 0..2 {
                let store = store.clone();
                let mut booking = pending(Ulid::new(), round * H, round * H + H);
                booking.id = id;
                handles.push(tokio::spawn(async move { store.persist_new_booking(booking).await }));
            }

            let mut winners = Vec::new();
            for h in handles {
                match h.await.unwrap() {
                    Ok(b) => winners.push(b),
                    Err(e) => assert_eq!(e, StoreError::DuplicateId(id)),
                }
            }
            assert_eq!(winners.len(), 1, "round {round}");

            let stored = store.get_booking(id).await.unwrap().unwrap();
            assert_eq!(stored.room_id, winners[0].room_id);
        }
        assert_eq!(store.booking_count(), 50);
        assert_eq!(store.list_bookings(None).await.unwrap().len(), 50);
    }
}
