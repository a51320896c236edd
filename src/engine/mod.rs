mod conflict;
mod error;
mod lifecycle;
mod queries;

pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::RoomId;
use crate::store::BookingStore;

/// Admission rules beyond `start < end` and the hard limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Refuse spans that start before the current time.
    pub reject_past: bool,
}

/// Booking lifecycle manager.
///
/// Admission is a read-check-write against the store; it runs under a
/// per-room async mutex so two overlapping requests for the same room are
/// serialized and the loser sees the winner's booking. Rooms never contend
/// with each other. Status transitions rely on the store's compare-and-swap.
pub struct Engine<S> {
    store: Arc<S>,
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,
    policy: AdmissionPolicy,
}

impl<S: BookingStore> Engine<S> {
    pub fn new(store: Arc<S>, policy: AdmissionPolicy) -> Self {
        Self {
            store,
            room_locks: DashMap::new(),
            policy,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Acquire the room's admission lock. The map guard is released before awaiting.
    pub(super) async fn lock_room(&self, room_id: RoomId) -> RoomGuard<'_> {
        let lock = self.room_locks.entry(room_id).or_default().clone();
        RoomGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.room_locks,
            room_id,
        }
    }
}

/// Held room admission lock.
///
/// On drop the mutex is released and the room's entry is removed when nobody
/// else holds or waits on it, so `room_locks` only covers rooms in flight.
/// Clones of the mutex are only taken under the map's shard lock, which
/// `remove_if` also holds, so a waiter can never be left on a removed mutex.
pub(crate) struct RoomGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<RoomId, Arc<Mutex<()>>>,
    room_id: RoomId,
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.room_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
