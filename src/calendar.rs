use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::observability::CALENDAR_CHANGES_TOTAL;
use crate::repo::BookingRepo;
use crate::session::{Authenticated, FlashKind, SessionError, SessionStore};
use crate::store::StoreError;

/// Form field a rendered, still-checked block carries. Absent on post-back
/// means the admin unchecked it.
const KEEP_PREFIX: &str = "remove_block_";
/// Form field for a newly checked day.
const ADD_PREFIX: &str = "add_block_";

/// Calendar month, held as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthAnchor {
    first: NaiveDate,
}

impl MonthAnchor {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|first| Self { first })
    }

    pub fn containing(day: NaiveDate) -> Self {
        Self {
            first: day - TimeDelta::days(i64::from(day.day0())),
        }
    }

    /// Month named by the `y`/`m` query parameters, or the month containing
    /// `today` when they are absent or unusable.
    pub fn from_query(year: Option<&str>, month: Option<&str>, today: NaiveDate) -> Self {
        let parsed = match (year, month) {
            (Some(y), Some(m)) => y
                .trim()
                .parse()
                .ok()
                .zip(m.trim().parse().ok())
                .and_then(|(y, m)| Self::new(y, m)),
            _ => None,
        };
        if parsed.is_none() && (year.is_some() || month.is_some()) {
            tracing::debug!(?year, ?month, "unusable calendar anchor, using current month");
        }
        parsed.unwrap_or_else(|| Self::containing(today))
    }

    pub fn year(&self) -> i32 {
        self.first.year()
    }

    pub fn month(&self) -> u32 {
        self.first.month()
    }

    pub fn next(&self) -> Self {
        Self {
            first: self.first + Months::new(1),
        }
    }

    pub fn prev(&self) -> Self {
        Self {
            first: self.first - Months::new(1),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        self.first
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first - TimeDelta::days(1)
    }

    pub fn days_in_month(&self) -> u32 {
        self.last_day().day()
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        DateSpan::new(self.first_day(), self.last_day()).days_inclusive()
    }

    pub fn labels(&self) -> MonthLabels {
        let (next, prev) = (self.next(), self.prev());
        MonthLabels {
            this_month: self.first.format("%m").to_string(),
            this_month_year: self.first.format("%Y").to_string(),
            next_month: next.first.format("%m").to_string(),
            next_month_year: next.first.format("%Y").to_string(),
            last_month: prev.first.format("%m").to_string(),
            last_month_year: prev.first.format("%Y").to_string(),
        }
    }
}

/// Two-digit month and four-digit year strings for the navigation links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthLabels {
    pub this_month: String,
    pub this_month_year: String,
    pub next_month: String,
    pub next_month_year: String,
    pub last_month: String,
    pub last_month_year: String,
}

/// Block state of one room's month as rendered, kept in the session as the
/// baseline for the post-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub room_id: RoomId,
    pub month: MonthAnchor,
    /// Every day of the month; 0 for no block, otherwise the block's id.
    pub block_day: BTreeMap<NaiveDate, RestrictionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomCalendar {
    pub room: Room,
    /// Every day of the month; 0 or the reservation occupying it.
    pub reservation_day: BTreeMap<NaiveDate, ReservationId>,
    pub block_day: BTreeMap<NaiveDate, RestrictionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarView {
    pub month: MonthAnchor,
    pub labels: MonthLabels,
    pub days_in_month: u32,
    pub rooms: Vec<RoomCalendar>,
}

/// Checkbox fields of a calendar post-back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarPost {
    keep: BTreeSet<(RoomId, NaiveDate)>,
    add: BTreeSet<(RoomId, NaiveDate)>,
}

fn parse_marker(rest: &str) -> Option<(RoomId, NaiveDate)> {
    let (room, day) = rest.split_once('_')?;
    Some((room.parse().ok()?, parse_date(day)?))
}

impl CalendarPost {
    /// Collect the keep and add markers among the posted field names.
    pub fn parse<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        let mut post = Self::default();
        for name in fields {
            let (set, rest) = if let Some(rest) = name.strip_prefix(KEEP_PREFIX) {
                (&mut post.keep, rest)
            } else if let Some(rest) = name.strip_prefix(ADD_PREFIX) {
                (&mut post.add, rest)
            } else {
                continue;
            };
            match parse_marker(rest) {
                Some(marker) => {
                    set.insert(marker);
                }
                None => tracing::debug!(field = name, "ignoring malformed calendar field"),
            }
        }
        post
    }

    /// The post a rendered form produces when submitted untouched.
    pub fn unchanged(snapshots: &[BlockSnapshot]) -> Self {
        let keep = snapshots
            .iter()
            .flat_map(|s| {
                s.block_day
                    .iter()
                    .filter(|(_, id)| **id > 0)
                    .map(move |(day, _)| (s.room_id, *day))
            })
            .collect();
        Self {
            keep,
            add: BTreeSet::new(),
        }
    }

    pub fn keeps(&self, room_id: RoomId, day: NaiveDate) -> bool {
        self.keep.contains(&(room_id, day))
    }

    /// Field names this post would carry, keep markers first.
    pub fn field_names(&self) -> Vec<String> {
        let keep = self
            .keep
            .iter()
            .map(|(room, day)| format!("{KEEP_PREFIX}{room}_{}", format_date(*day)));
        let add = self
            .add
            .iter()
            .map(|(room, day)| format!("{ADD_PREFIX}{room}_{}", format_date(*day)));
        keep.chain(add).collect()
    }

    pub fn add_block(&mut self, room_id: RoomId, day: NaiveDate) {
        self.add.insert((room_id, day));
    }

    pub fn unkeep(&mut self, room_id: RoomId, day: NaiveDate) {
        self.keep.remove(&(room_id, day));
    }
}

/// Writes a post-back turns into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub deletes: BTreeSet<RestrictionId>,
    pub inserts: Vec<(RoomId, NaiveDate)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }
}

/// Diff the rendered snapshots against the post.
///
/// A block is deleted when any of its rendered days lost its keep marker.
/// Every add marker becomes a single-day block, whether or not that day is
/// already blocked.
pub fn plan(snapshots: &[BlockSnapshot], post: &CalendarPost) -> ChangeSet {
    let deletes = snapshots
        .iter()
        .flat_map(|s| {
            s.block_day
                .iter()
                .filter(move |(day, id)| **id > 0 && !post.keeps(s.room_id, **day))
                .map(|(_, id)| *id)
        })
        .collect();
    ChangeSet {
        deletes,
        inserts: post.add.iter().copied().collect(),
    }
}

#[derive(Debug)]
pub enum CalendarError {
    Store(StoreError),
    Session(SessionError),
    /// Post-back for a room the session never rendered.
    SnapshotMissing(RoomId),
}

impl From<StoreError> for CalendarError {
    fn from(e: StoreError) -> Self {
        CalendarError::Store(e)
    }
}

impl From<SessionError> for CalendarError {
    fn from(e: SessionError) -> Self {
        CalendarError::Session(e)
    }
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::Store(e) => write!(f, "store error: {e}"),
            CalendarError::Session(e) => write!(f, "{e}"),
            CalendarError::SnapshotMissing(room_id) => {
                write!(f, "no rendered calendar for room {room_id} in session")
            }
        }
    }
}

impl std::error::Error for CalendarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CalendarError::Store(e) => Some(e),
            CalendarError::Session(e) => Some(e),
            CalendarError::SnapshotMissing(_) => None,
        }
    }
}

fn month_map(month: MonthAnchor) -> BTreeMap<NaiveDate, i64> {
    month.days().map(|d| (d, 0)).collect()
}

/// Mark every day of `span`, both ends included, that falls inside `month`.
fn mark_days(map: &mut BTreeMap<NaiveDate, i64>, span: &DateSpan, month: MonthAnchor, value: i64) {
    let clamped = DateSpan::new(
        span.start.max(month.first_day()),
        span.end.min(month.last_day()),
    );
    for day in clamped.days_inclusive() {
        map.insert(day, value);
    }
}

/// Admin month calendar: renders per-room day maps and applies the
/// checkbox post-back.
pub struct CalendarEngine {
    repo: Arc<dyn BookingRepo>,
    sessions: Arc<SessionStore>,
}

impl CalendarEngine {
    pub fn new(repo: Arc<dyn BookingRepo>, sessions: Arc<SessionStore>) -> Self {
        Self { repo, sessions }
    }

    /// Build the month view for every room and store each room's block map
    /// in the admin's session.
    pub async fn render(
        &self,
        admin: &Authenticated,
        month: MonthAnchor,
    ) -> Result<CalendarView, CalendarError> {
        let session = admin.session();
        let rooms = self.repo.all_rooms().await?;
        let mut views = Vec::with_capacity(rooms.len());
        for room in rooms {
            let restrictions = self
                .repo
                .restrictions_for_room_in_range(room.id, month.first_day(), month.last_day())
                .await?;
            let mut reservation_day = month_map(month);
            let mut block_day = month_map(month);
            for r in &restrictions {
                if r.is_block() {
                    mark_days(&mut block_day, &r.span, month, r.id);
                } else {
                    mark_days(&mut reservation_day, &r.span, month, r.reservation_id_or_zero());
                }
            }
            self.sessions.put_snapshot(
                session,
                BlockSnapshot {
                    room_id: room.id,
                    month,
                    block_day: block_day.clone(),
                },
            )?;
            views.push(RoomCalendar {
                room,
                reservation_day,
                block_day,
            });
        }
        tracing::debug!(
            user_id = admin.user_id(),
            year = month.year(),
            month = month.month(),
            rooms = views.len(),
            "calendar rendered"
        );
        Ok(CalendarView {
            month,
            labels: month.labels(),
            days_in_month: month.days_in_month(),
            rooms: views,
        })
    }

    /// Apply a post-back against the snapshots of the last render.
    ///
    /// Every room's snapshot must be present before anything is written.
    /// Individual write failures are logged and skipped; the returned set
    /// holds only the writes that succeeded. Snapshots stay in the session,
    /// so posting again repeats the inserts.
    pub async fn reconcile(
        &self,
        admin: &Authenticated,
        post: &CalendarPost,
    ) -> Result<ChangeSet, CalendarError> {
        let session = admin.session();
        let rooms = self.repo.all_rooms().await?;
        let snapshots = rooms
            .iter()
            .map(|room| {
                self.sessions
                    .snapshot(session, room.id)
                    .ok_or(CalendarError::SnapshotMissing(room.id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let planned = plan(&snapshots, post);
        let mut applied = ChangeSet::default();

        for id in planned.deletes {
            match self.repo.delete_restriction(id).await {
                Ok(()) => {
                    metrics::counter!(CALENDAR_CHANGES_TOTAL, "kind" => "delete", "status" => "ok")
                        .increment(1);
                    applied.deletes.insert(id);
                }
                Err(e) => {
                    metrics::counter!(
                        CALENDAR_CHANGES_TOTAL,
                        "kind" => "delete",
                        "status" => "failed"
                    )
                    .increment(1);
                    tracing::warn!(restriction_id = id, "cannot remove block: {e}");
                }
            }
        }
        for (room_id, day) in planned.inserts {
            match self.repo.insert_block_for_room(room_id, day).await {
                Ok(restriction_id) => {
                    metrics::counter!(CALENDAR_CHANGES_TOTAL, "kind" => "insert", "status" => "ok")
                        .increment(1);
                    tracing::debug!(room_id, %day, restriction_id, "block added");
                    applied.inserts.push((room_id, day));
                }
                Err(e) => {
                    metrics::counter!(
                        CALENDAR_CHANGES_TOTAL,
                        "kind" => "insert",
                        "status" => "failed"
                    )
                    .increment(1);
                    tracing::warn!(room_id, %day, "cannot add block: {e}");
                }
            }
        }

        tracing::info!(
            user_id = admin.user_id(),
            deleted = applied.deletes.len(),
            inserted = applied.inserts.len(),
            "calendar changes saved"
        );
        self.sessions.put_flash(session, FlashKind::Flash, "Changes saved")?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::flaky::FlakyRepo;
    use crate::store::Store;
    use std::path::PathBuf;
    use std::time::Duration;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn march() -> MonthAnchor {
        MonthAnchor::new(2024, 3).unwrap()
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookings_test_calendar");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seeded_store(name: &str) -> Store {
        let store = Store::open(test_wal_path(name)).unwrap();
        store.insert_room("General's Quarters").await.unwrap();
        store.insert_room("Major's Suite").await.unwrap();
        store
    }

    fn engine(repo: Arc<dyn BookingRepo>) -> (CalendarEngine, Arc<SessionStore>, Authenticated) {
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(60)));
        let id = sessions.create();
        sessions.put_user(id, 1).unwrap();
        let admin = sessions.require_user(id).unwrap();
        (CalendarEngine::new(repo, sessions.clone()), sessions, admin)
    }

    fn room(view: &CalendarView, room_id: RoomId) -> &RoomCalendar {
        view.rooms.iter().find(|r| r.room.id == room_id).unwrap()
    }

    #[test]
    fn month_arithmetic() {
        let m = march();
        assert_eq!(m.days_in_month(), 31);
        assert_eq!(m.first_day(), d("2024-03-01"));
        assert_eq!(m.last_day(), d("2024-03-31"));
        assert_eq!(MonthAnchor::new(2024, 2).unwrap().days_in_month(), 29);
        assert_eq!(MonthAnchor::new(2023, 2).unwrap().days_in_month(), 28);

        let jan = MonthAnchor::new(2024, 1).unwrap();
        assert_eq!(jan.prev(), MonthAnchor::new(2023, 12).unwrap());
        assert_eq!(MonthAnchor::new(2023, 12).unwrap().next(), jan);

        let labels = jan.labels();
        assert_eq!(labels.this_month, "01");
        assert_eq!(labels.last_month, "12");
        assert_eq!(labels.last_month_year, "2023");
        assert_eq!(labels.next_month, "02");
        assert_eq!(labels.next_month_year, "2024");
    }

    #[test]
    fn anchor_from_query() {
        let today = d("2024-07-19");
        assert_eq!(MonthAnchor::from_query(Some("2024"), Some("3"), today), march());
        assert_eq!(
            MonthAnchor::from_query(None, None, today),
            MonthAnchor::new(2024, 7).unwrap()
        );
        assert_eq!(
            MonthAnchor::from_query(Some("2024"), Some("13"), today),
            MonthAnchor::new(2024, 7).unwrap()
        );
        assert_eq!(MonthAnchor::containing(d("2024-03-31")), march());
    }

    #[test]
    fn post_parsing() {
        let post = CalendarPost::parse([
            "remove_block_2_2024-03-05",
            "add_block_1_2024-03-10",
            "add_block_1_2024-03-10",
            "add_block_x_2024-03-10",
            "add_block_1_not-a-date",
            "csrf_token",
            "y",
        ]);
        assert!(post.keeps(2, d("2024-03-05")));
        assert!(!post.keeps(1, d("2024-03-05")));
        assert_eq!(post.add.len(), 1);
        assert_eq!(
            post.field_names(),
            vec!["remove_block_2_2024-03-05", "add_block_1_2024-03-10"]
        );
    }

    fn snapshot(room_id: RoomId, blocks: &[(&str, RestrictionId)]) -> BlockSnapshot {
        let mut block_day = month_map(march());
        for (day, id) in blocks {
            block_day.insert(d(day), *id);
        }
        BlockSnapshot {
            room_id,
            month: march(),
            block_day,
        }
    }

    #[test]
    fn unchanged_post_plans_nothing() {
        let snapshots = vec![
            snapshot(1, &[("2024-03-05", 7), ("2024-03-06", 7)]),
            snapshot(2, &[("2024-03-20", 9)]),
        ];
        let post = CalendarPost::unchanged(&snapshots);
        assert!(plan(&snapshots, &post).is_empty());
        assert!(plan(&snapshots, &post).is_empty());
    }

    #[test]
    fn unchecking_any_day_of_a_block_deletes_it_once() {
        let snapshots = vec![snapshot(1, &[("2024-03-05", 7), ("2024-03-06", 7)])];
        let mut post = CalendarPost::unchanged(&snapshots);
        post.unkeep(1, d("2024-03-06"));
        let changes = plan(&snapshots, &post);
        assert_eq!(changes.deletes.into_iter().collect::<Vec<_>>(), vec![7]);
        assert!(changes.inserts.is_empty());
    }

    #[test]
    fn add_markers_insert_even_over_existing_blocks() {
        let snapshots = vec![snapshot(1, &[("2024-03-05", 7)])];
        let mut post = CalendarPost::unchanged(&snapshots);
        post.add_block(1, d("2024-03-05"));
        let changes = plan(&snapshots, &post);
        assert!(changes.deletes.is_empty());
        assert_eq!(changes.inserts, vec![(1, d("2024-03-05"))]);
    }

    #[tokio::test]
    async fn render_splits_reservations_and_blocks() {
        let store = Arc::new(seeded_store("render.wal").await);
        let res_id = store
            .insert_reservation(NewReservation {
                guest: GuestDetails::default(),
                room_id: 1,
                span: DateSpan::new(d("2024-02-28"), d("2024-03-02")),
            })
            .await
            .unwrap();
        store
            .insert_restriction(NewRestriction::for_reservation(
                1,
                DateSpan::new(d("2024-02-28"), d("2024-03-02")),
                res_id,
            ))
            .await
            .unwrap();
        let block = store.insert_block_for_room(1, d("2024-03-31")).await.unwrap();
        store.insert_block_for_room(1, d("2024-04-01")).await.unwrap();

        let (engine, sessions, admin) = engine(store.clone());
        let view = engine.render(&admin, march()).await.unwrap();
        assert_eq!(view.days_in_month, 31);
        assert_eq!(view.labels.next_month, "04");

        let r1 = room(&view, 1);
        assert_eq!(r1.reservation_day.len(), 31);
        assert_eq!(r1.reservation_day[&d("2024-03-01")], res_id);
        // The checkout day is drawn as occupied.
        assert_eq!(r1.reservation_day[&d("2024-03-02")], res_id);
        assert_eq!(r1.reservation_day[&d("2024-03-03")], 0);
        assert_eq!(r1.block_day[&d("2024-03-31")], block);
        assert!(!r1.block_day.contains_key(&d("2024-04-01")));

        let snap = sessions.snapshot(admin.session(), 1).unwrap();
        assert_eq!(snap.block_day, r1.block_day);
        assert_eq!(snap.month, march());
        assert!(sessions.snapshot(admin.session(), 2).is_some());
    }

    #[tokio::test]
    async fn single_day_block_on_the_first_is_not_drawn() {
        let store = Arc::new(seeded_store("first_day.wal").await);
        store.insert_block_for_room(1, d("2024-03-01")).await.unwrap();
        let (engine, _sessions, admin) = engine(store.clone());
        let view = engine.render(&admin, march()).await.unwrap();
        assert_eq!(room(&view, 1).block_day[&d("2024-03-01")], 0);
    }

    #[tokio::test]
    async fn unchecked_block_is_removed() {
        let store = Arc::new(seeded_store("remove.wal").await);
        store.insert_block_for_room(2, d("2024-03-05")).await.unwrap();
        let (engine, sessions, admin) = engine(store.clone());

        let view = engine.render(&admin, march()).await.unwrap();
        assert!(room(&view, 2).block_day[&d("2024-03-05")] > 0);

        let applied = engine.reconcile(&admin, &CalendarPost::default()).await.unwrap();
        assert_eq!(applied.deletes.len(), 1);
        assert_eq!(
            sessions.take_flash(admin.session(), FlashKind::Flash).as_deref(),
            Some("Changes saved")
        );

        let view = engine.render(&admin, march()).await.unwrap();
        assert_eq!(room(&view, 2).block_day[&d("2024-03-05")], 0);
    }

    #[tokio::test]
    async fn resubmitting_without_render_duplicates_inserts() {
        let store = Arc::new(seeded_store("resubmit.wal").await);
        let existing = store.insert_block_for_room(1, d("2024-03-05")).await.unwrap();
        let (engine, _sessions, admin) = engine(store.clone());
        engine.render(&admin, march()).await.unwrap();

        let post = CalendarPost::parse(["add_block_1_2024-03-10"]);
        let first = engine.reconcile(&admin, &post).await.unwrap();
        assert_eq!(first.deletes.into_iter().collect::<Vec<_>>(), vec![existing]);
        assert_eq!(first.inserts.len(), 1);

        // Same snapshot again: the delete is a no-op, the insert repeats.
        let second = engine.reconcile(&admin, &post).await.unwrap();
        assert_eq!(second.deletes.len(), 1);
        assert_eq!(second.inserts.len(), 1);

        let rows = store
            .restrictions_for_room_in_range(1, d("2024-03-01"), d("2024-03-31"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.span == DateSpan::day(d("2024-03-10"))));
    }

    #[tokio::test]
    async fn missing_snapshot_writes_nothing() {
        let store = Arc::new(seeded_store("missing.wal").await);
        let (engine, _sessions, admin) = engine(store.clone());
        let post = CalendarPost::parse(["add_block_1_2024-03-10"]);
        let err = engine.reconcile(&admin, &post).await.unwrap_err();
        assert!(matches!(err, CalendarError::SnapshotMissing(1)));
        assert_eq!(store.restriction_count(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_writes_are_skipped() {
        let repo = Arc::new(FlakyRepo::new(seeded_store("flaky.wal").await));
        let block = repo.inner.insert_block_for_room(1, d("2024-03-05")).await.unwrap();
        let (engine, _sessions, admin) = engine(repo.clone());
        engine.render(&admin, march()).await.unwrap();

        repo.fail("delete_restriction");
        let post = CalendarPost::parse(["add_block_2_2024-03-10"]);
        let applied = engine.reconcile(&admin, &post).await.unwrap();
        assert!(applied.deletes.is_empty());
        assert_eq!(applied.inserts, vec![(2, d("2024-03-10"))]);
        assert_eq!(repo.inner.restriction_count(1).await.unwrap(), 1);

        repo.heal("delete_restriction");
        let applied = engine.reconcile(&admin, &CalendarPost::default()).await.unwrap();
        assert_eq!(applied.deletes.into_iter().collect::<Vec<_>>(), vec![block]);
    }
}
