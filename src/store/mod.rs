mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::limits::{QUERY_TIMEOUT, WAL_CHANNEL_CAPACITY};
use crate::model::*;
use crate::observability::{
    STORE_OP_DURATION_SECONDS, STORE_OPS_TOTAL, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS,
};
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Point in time by which a store call must have finished waiting.
pub(super) type Deadline = tokio::time::Instant;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// fsync once and answer every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(batch = batch.len(), "WAL flush failed: {e}");
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after an append error so half-buffered bytes do not leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Monotonic id allocators, one per table. Ids start at 1 and are never
/// reissued, including across compaction and restart.
#[derive(Debug, Default)]
pub(super) struct Sequences {
    room: AtomicI64,
    reservation: AtomicI64,
    restriction: AtomicI64,
    user: AtomicI64,
}

impl Sequences {
    fn bump(counter: &AtomicI64, seen: i64) {
        counter.fetch_max(seen, Ordering::SeqCst);
    }

    /// Current high-water marks as a WAL event.
    pub(super) fn snapshot(&self) -> Event {
        Event::SequencesAt {
            room: self.room.load(Ordering::SeqCst),
            reservation: self.reservation.load(Ordering::SeqCst),
            restriction: self.restriction.load(Ordering::SeqCst),
            user: self.user.load(Ordering::SeqCst),
        }
    }

    pub(super) fn next_room(&self) -> RoomId {
        self.room.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(super) fn next_reservation(&self) -> ReservationId {
        self.reservation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(super) fn next_restriction(&self) -> RestrictionId {
        self.restriction.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(super) fn next_user(&self) -> UserId {
        self.user.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// WAL-backed store for the `rooms`, `reservations`, `room_restrictions` and
/// `users` tables.
///
/// Every room owns one `RwLock<RoomState>`; all writes touching a room
/// (restrictions and that room's reservations) hold its write lock across
/// WAL append and apply, which is what serializes the overlap-guarded insert.
pub struct Store {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    pub(super) reservations: DashMap<ReservationId, Reservation>,
    /// Reverse lookup: restriction id → room id.
    pub(super) restriction_to_room: DashMap<RestrictionId, RoomId>,
    pub(super) users: DashMap<UserId, User>,
    /// Serializes user writes so the email uniqueness check holds.
    pub(super) users_lock: Mutex<()>,
    pub(super) seq: Sequences,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss an in-flight append.
    pub(super) write_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) query_timeout: Duration,
}

/// Apply a room-scoped event to its `RoomState` (caller holds the lock).
pub(super) fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    index: &DashMap<RestrictionId, RoomId>,
) {
    match event {
        Event::RestrictionInserted {
            id,
            room_id,
            span,
            kind,
            reservation_id,
            at,
        } => {
            rs.insert_restriction(RoomRestriction {
                id: *id,
                room_id: *room_id,
                span: *span,
                kind: *kind,
                reservation_id: *reservation_id,
                created_at: *at,
                updated_at: *at,
            });
            index.insert(*id, *room_id);
        }
        Event::RestrictionDeleted { id, .. } => {
            rs.remove_restriction(*id);
            index.remove(id);
        }
        // Restrictions referencing the reservation go with it.
        Event::ReservationDeleted { id } => {
            for removed in rs.remove_for_reservation(*id) {
                index.remove(&removed);
            }
        }
        _ => {}
    }
}

/// Apply a reservation-table event.
pub(super) fn apply_to_reservations(
    reservations: &DashMap<ReservationId, Reservation>,
    event: &Event,
) {
    match event {
        Event::ReservationInserted {
            id,
            room_id,
            guest,
            span,
            at,
        } => {
            reservations.insert(
                *id,
                Reservation {
                    id: *id,
                    guest: guest.clone(),
                    room_id: *room_id,
                    room_name: String::new(),
                    span: *span,
                    processed: false,
                    created_at: *at,
                    updated_at: *at,
                },
            );
        }
        Event::ReservationUpdated { id, guest, at } => {
            if let Some(mut row) = reservations.get_mut(id) {
                row.guest = guest.clone();
                row.updated_at = *at;
            }
        }
        Event::ReservationProcessed { id, processed, at } => {
            if let Some(mut row) = reservations.get_mut(id) {
                row.processed = *processed;
                row.updated_at = *at;
            }
        }
        Event::ReservationDeleted { id } => {
            reservations.remove(id);
        }
        _ => {}
    }
}

/// Apply a user-table event.
pub(super) fn apply_to_users(users: &DashMap<UserId, User>, event: &Event) {
    match event {
        Event::UserCreated {
            id,
            profile,
            password_hash,
            at,
        } => {
            users.insert(
                *id,
                User {
                    id: *id,
                    profile: profile.clone(),
                    password_hash: password_hash.clone(),
                    created_at: *at,
                    updated_at: *at,
                },
            );
        }
        Event::UserUpdated { id, profile, at } => {
            if let Some(mut row) = users.get_mut(id) {
                row.profile = profile.clone();
                row.updated_at = *at;
            }
        }
        _ => {}
    }
}

impl Store {
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Self::open_with_timeout(wal_path, QUERY_TIMEOUT)
    }

    pub fn open_with_timeout(wal_path: PathBuf, query_timeout: Duration) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            rooms: DashMap::new(),
            reservations: DashMap::new(),
            restriction_to_room: DashMap::new(),
            users: DashMap::new(),
            users_lock: Mutex::new(()),
            seq: Sequences::default(),
            write_gate: RwLock::new(()),
            wal_tx,
            query_timeout,
        };

        // Sole owner of every Arc here, so try_write never contends. Never use
        // blocking_write: this may run inside an async context.
        for event in &events {
            store.replay_event(event);
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            rooms = store.rooms.len(),
            reservations = store.reservations.len(),
            users = store.users.len(),
            "store opened"
        );
        Ok(store)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::RoomCreated { id, name, at } => {
                Sequences::bump(&self.seq.room, *id);
                let room = Room {
                    id: *id,
                    name: name.clone(),
                    created_at: *at,
                    updated_at: *at,
                };
                self.rooms.insert(*id, Arc::new(RwLock::new(RoomState::new(room))));
            }
            Event::RestrictionInserted { id, room_id, .. } => {
                Sequences::bump(&self.seq.restriction, *id);
                self.replay_on_room(*room_id, event);
            }
            Event::RestrictionDeleted { room_id, .. } => self.replay_on_room(*room_id, event),
            Event::ReservationInserted { id, .. } => {
                Sequences::bump(&self.seq.reservation, *id);
                apply_to_reservations(&self.reservations, event);
            }
            Event::ReservationDeleted { id } => {
                if let Some(room_id) = self.reservations.get(id).map(|r| r.room_id) {
                    self.replay_on_room(room_id, event);
                }
                apply_to_reservations(&self.reservations, event);
            }
            Event::ReservationUpdated { .. } | Event::ReservationProcessed { .. } => {
                apply_to_reservations(&self.reservations, event);
            }
            Event::UserCreated { id, .. } => {
                Sequences::bump(&self.seq.user, *id);
                apply_to_users(&self.users, event);
            }
            Event::UserUpdated { .. } => apply_to_users(&self.users, event),
            Event::SequencesAt {
                room,
                reservation,
                restriction,
                user,
            } => {
                Sequences::bump(&self.seq.room, *room);
                Sequences::bump(&self.seq.reservation, *reservation);
                Sequences::bump(&self.seq.restriction, *restriction);
                Sequences::bump(&self.seq.user, *user);
            }
        }
    }

    fn replay_on_room(&self, room_id: RoomId, event: &Event) {
        let Some(entry) = self.rooms.get(&room_id) else {
            tracing::warn!(room_id, "WAL references unknown room, skipping event");
            return;
        };
        let rs = entry.value().clone();
        drop(entry);
        match rs.try_write() {
            Ok(mut guard) => apply_to_room(&mut guard, event, &self.restriction_to_room),
            Err(_) => tracing::error!(room_id, "room state contended during replay"),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Deadline for a store call starting now. Taken once at call entry and
    /// shared by every wait in that call.
    pub(super) fn deadline(&self) -> Deadline {
        Deadline::now() + self.query_timeout
    }

    /// Write event to WAL via the background group-commit writer. Queueing
    /// is bounded by `deadline`; once the writer holds the event the caller
    /// waits for its durable result.
    pub(super) async fn wal_append(
        &self,
        event: &Event,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        let command = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        self.bounded("wal_append", deadline, self.wal_tx.send(command))
            .await?
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    /// Bound `fut` by the call's deadline. Used around every wait that can
    /// stall on contention.
    pub(super) async fn bounded<T>(
        &self,
        op: &'static str,
        deadline: Deadline,
        fut: impl Future<Output = T>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| StoreError::Timeout(op))
    }

    /// Record latency and outcome of a store call.
    pub(crate) async fn instrumented<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let started = Instant::now();
        let result = fut.await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(STORE_OPS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(STORE_OP_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(op, status, "store call failed: {e}");
        }
        result
    }

    pub(super) fn room_handle(&self, room_id: RoomId) -> Option<SharedRoomState> {
        self.rooms.get(&room_id).map(|e| e.value().clone())
    }

    /// Look up a room and take its write lock before `deadline`.
    pub(super) async fn lock_room_write(
        &self,
        op: &'static str,
        deadline: Deadline,
        room_id: RoomId,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, StoreError> {
        let rs = self.room_handle(room_id).ok_or(StoreError::NotFound {
            entity: "room",
            id: room_id,
        })?;
        self.bounded(op, deadline, rs.write_owned()).await
    }

    /// WAL-append then apply to the locked room.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        self.wal_append(event, deadline).await?;
        apply_to_room(rs, event, &self.restriction_to_room);
        apply_to_reservations(&self.reservations, event);
        Ok(())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
