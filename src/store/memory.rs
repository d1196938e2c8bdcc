use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{BookingStore, Guard, Patch, StoreError};
use crate::bus::{ChangeBus, ChangeEvent};
use crate::model::{BookingId, PartyId, RideBooking, RideStatus};

#[derive(Debug)]
struct StoredRow {
    seq: u64,
    booking: RideBooking,
}

#[derive(Debug, Default)]
struct Rows {
    by_id: HashMap<BookingId, StoredRow>,
    next_seq: u64,
}

impl Rows {
    /// Clone matching rows, newest first.
    fn collect(&self, mut keep: impl FnMut(&RideBooking) -> bool) -> Vec<RideBooking> {
        let mut rows: Vec<&StoredRow> = self.by_id.values().filter(|r| keep(&r.booking)).collect();
        rows.sort_by(|a, b| {
            b.booking
                .created_at
                .cmp(&a.booking.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        rows.into_iter().map(|r| r.booking.clone()).collect()
    }
}

/// In-process booking store.
///
/// Every write holds the row lock while it checks its guard, commits and
/// publishes, so updates to one row are linearized and reach the bus in
/// commit order.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Mutex<Rows>,
    bus: ChangeBus,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(bus: ChangeBus) -> Self {
        Self {
            rows: Mutex::new(Rows::default()),
            bus,
            offline: AtomicBool::new(false),
        }
    }

    pub fn with_capacity(bus_capacity: usize) -> Self {
        Self::new(ChangeBus::new(bus_capacity))
    }

    /// Simulate losing (or regaining) connectivity to the store.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl BookingStore for MemoryStore {
    async fn insert(&self, booking: RideBooking) -> Result<RideBooking, StoreError> {
        self.ensure_online()?;
        let mut rows = self.rows.lock().await;
        if rows.by_id.contains_key(&booking.id) {
            return Err(StoreError::DuplicateId(booking.id));
        }

        let seq = rows.next_seq;
        rows.next_seq += 1;
        rows.by_id.insert(
            booking.id,
            StoredRow {
                seq,
                booking: booking.clone(),
            },
        );

        let delivered = self.bus.publish(ChangeEvent::insert(booking.clone()));
        debug!(booking = %booking.id, delivered, "row inserted");
        Ok(booking)
    }

    async fn get(&self, id: BookingId) -> Result<Option<RideBooking>, StoreError> {
        self.ensure_online()?;
        let rows = self.rows.lock().await;
        Ok(rows.by_id.get(&id).map(|r| r.booking.clone()))
    }

    async fn update_where(
        &self,
        id: BookingId,
        guard: Guard,
        patch: Patch,
    ) -> Result<Option<RideBooking>, StoreError> {
        self.ensure_online()?;
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.by_id.get_mut(&id) else {
            return Ok(None);
        };
        if !guard.holds(&row.booking) {
            let status = row.booking.status;
            debug!(booking = %id, status = %status, "conditional update matched no row");
            return Ok(None);
        }
        if !patch.keeps_lifecycle(&row.booking) {
            warn!(
                booking = %id,
                from = %row.booking.status,
                to = ?patch.status,
                "update would break the ride lifecycle; refused"
            );
            return Ok(None);
        }

        patch.apply(&mut row.booking);
        let updated = row.booking.clone();

        let delivered = self.bus.publish(ChangeEvent::update(updated.clone()));
        debug!(booking = %id, status = %updated.status, delivered, "row updated");
        Ok(Some(updated))
    }

    async fn by_status(&self, statuses: &[RideStatus]) -> Result<Vec<RideBooking>, StoreError> {
        self.ensure_online()?;
        let rows = self.rows.lock().await;
        Ok(rows.collect(|b| statuses.contains(&b.status)))
    }

    async fn by_party(&self, party: &PartyId) -> Result<Vec<RideBooking>, StoreError> {
        self.ensure_online()?;
        let rows = self.rows.lock().await;
        Ok(rows.collect(|b| b.involves(party)))
    }

    fn changes(&self) -> &ChangeBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChangeKind, Interest};
    use crate::geo::Coordinate;
    use crate::model::{EscrowState, NewBooking};
    use chrono::{Duration, Utc};

    fn row(passenger: &str) -> RideBooking {
        let request = NewBooking::new(
            PartyId::new(passenger),
            Coordinate::new(28.6, 77.2),
            Coordinate::new(28.7, 77.3),
        );
        RideBooking::from_request(request, Utc::now())
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = MemoryStore::with_capacity(16);
        let booking = store.insert(row("p1")).await.unwrap();

        let fetched = store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(fetched, booking);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let store = MemoryStore::with_capacity(16);
        let booking = store.insert(row("p1")).await.unwrap();

        let result = store.insert(booking.clone()).await;
        assert_eq!(result, Err(StoreError::DuplicateId(booking.id)));
    }

    #[tokio::test]
    async fn update_applies_only_when_guard_holds() {
        let store = MemoryStore::with_capacity(16);
        let booking = store.insert(row("p1")).await.unwrap();

        let first = store
            .update_where(
                booking.id,
                Guard::status(RideStatus::Waiting),
                Patch::status(RideStatus::Accepted),
            )
            .await
            .unwrap();
        assert_eq!(first.map(|b| b.status), Some(RideStatus::Accepted));

        let second = store
            .update_where(
                booking.id,
                Guard::status(RideStatus::Waiting),
                Patch::status(RideStatus::Cancelled),
            )
            .await
            .unwrap();
        assert!(second.is_none());

        let stored = store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Accepted);
    }

    #[tokio::test]
    async fn every_update_bumps_the_revision() {
        let store = MemoryStore::with_capacity(16);
        let booking = store.insert(row("p1")).await.unwrap();
        assert_eq!(booking.revision, 0);

        let accepted = store
            .update_where(booking.id, Guard::default(), Patch::status(RideStatus::Accepted))
            .await
            .unwrap()
            .unwrap();
        let pending = store
            .update_where(booking.id, Guard::default(), Patch::escrow(EscrowState::PendingLock))
            .await
            .unwrap()
            .unwrap();
        let rolled_back = store
            .update_where(booking.id, Guard::default(), Patch::escrow(EscrowState::None))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(accepted.revision, 1);
        assert_eq!(pending.revision, 2);
        assert_eq!(rolled_back.revision, 3);
        // same fields as `accepted`, but a later version
        assert_eq!(rolled_back.escrow_state, accepted.escrow_state);
    }

    #[tokio::test]
    async fn backwards_status_is_refused_even_without_guard() {
        let store = MemoryStore::with_capacity(16);
        let booking = store.insert(row("p1")).await.unwrap();
        store
            .update_where(booking.id, Guard::default(), Patch::status(RideStatus::Cancelled))
            .await
            .unwrap();
        let mut feed = store.changes().subscribe(Interest::Party(PartyId::new("p1")));

        let result = store
            .update_where(booking.id, Guard::default(), Patch::status(RideStatus::Waiting))
            .await
            .unwrap();
        assert!(result.is_none());
        let stored = store.get(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
        assert!(feed.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_row_affects_nothing() {
        let store = MemoryStore::with_capacity(16);
        let result = store
            .update_where(BookingId::new(), Guard::default(), Patch::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn queries_return_newest_first() {
        let store = MemoryStore::with_capacity(16);
        let mut older = row("p1");
        older.created_at = Utc::now() - Duration::minutes(5);
        let older = store.insert(older).await.unwrap();
        let newer = store.insert(row("p2")).await.unwrap();

        let waiting = store.by_status(&[RideStatus::Waiting]).await.unwrap();
        let ids: Vec<_> = waiting.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);

        let mine = store.by_party(&PartyId::new("p1")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, older.id);
    }

    #[tokio::test]
    async fn commits_are_published() {
        let store = MemoryStore::with_capacity(16);
        let mut feed = store.changes().subscribe(Interest::Party(PartyId::new("p1")));

        let booking = store.insert(row("p1")).await.unwrap();
        store
            .update_where(
                booking.id,
                Guard::default(),
                Patch::status(RideStatus::Cancelled),
            )
            .await
            .unwrap();

        let insert = feed.recv().await.unwrap();
        assert_eq!(insert.kind, ChangeKind::Insert);
        let update = feed.recv().await.unwrap();
        assert_eq!(update.kind, ChangeKind::Update);
        assert_eq!(update.booking.status, RideStatus::Cancelled);
    }

    #[tokio::test]
    async fn failed_predicate_publishes_nothing() {
        let store = MemoryStore::with_capacity(16);
        let booking = store.insert(row("p1")).await.unwrap();
        let mut feed = store.changes().subscribe(Interest::Waiting);

        store
            .update_where(
                booking.id,
                Guard::status(RideStatus::Accepted),
                Patch::status(RideStatus::Completed),
            )
            .await
            .unwrap();
        assert_eq!(feed.try_recv().unwrap().map(|e| e.booking.id), None);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::with_capacity(16);
        store.set_offline(true);
        assert!(matches!(
            store.insert(row("p1")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.by_status(&RideStatus::ACTIVE).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_offline(false);
        assert!(store.is_empty().await);
    }
}
