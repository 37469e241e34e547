use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type RoomId = i64;
pub type ReservationId = i64;
pub type RestrictionId = i64;
pub type UserId = i64;

/// Wire/form date layout used everywhere a date is rendered as text.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Half-open date range `[start, end)`.
///
/// `start == end` is permitted: such a span overlaps nothing, which is what
/// makes a zero-length availability query always come back free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Single calendar day as stored for admin blocks: `start == end == day`.
    pub fn day(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// The booking overlap predicate: `self.start < other.end && self.end > other.start`.
    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Calendar inclusion test: strict on the leading edge, inclusive on the
    /// trailing edge (`self.start < other.end && self.end >= other.start`).
    pub fn touches(&self, other: &DateSpan) -> bool {
        self.start < other.end && self.end >= other.start
    }

    #[allow(dead_code)]
    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    /// Every day from `start` through `end`, both inclusive.
    pub fn days_inclusive(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

/// Kind tag carried by every restriction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RestrictionKind {
    /// Created as the side effect of a reservation.
    Reservation = 1,
    /// Manual admin block (maintenance, owner stay).
    Block = 2,
}

impl RestrictionKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Reservation),
            2 => Some(Self::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Guest-editable fields of a reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

impl GuestDetails {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub guest: GuestDetails,
    pub room_id: RoomId,
    /// Joined from `rooms` on read; empty if the room is gone.
    pub room_name: String,
    pub span: DateSpan,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRestriction {
    pub id: RestrictionId,
    pub room_id: RoomId,
    pub span: DateSpan,
    pub kind: RestrictionKind,
    /// `Some(id > 0)` only for reservation-backed rows; blocks carry `None`.
    pub reservation_id: Option<ReservationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoomRestriction {
    /// NULL-safe view of `reservation_id`: absent decodes as 0.
    pub fn reservation_id_or_zero(&self) -> ReservationId {
        self.reservation_id.unwrap_or(0)
    }

    pub fn is_block(&self) -> bool {
        self.reservation_id_or_zero() <= 0
    }
}

/// Editable fields of an admin account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub access_level: i32,
}

/// Admin account. `password_hash` is a bcrypt hash, never the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub profile: UserProfile,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub guest: GuestDetails,
    pub room_id: RoomId,
    pub span: DateSpan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRestriction {
    pub room_id: RoomId,
    pub span: DateSpan,
    pub kind: RestrictionKind,
    pub reservation_id: Option<ReservationId>,
}

impl NewRestriction {
    pub fn for_reservation(room_id: RoomId, span: DateSpan, reservation_id: ReservationId) -> Self {
        Self {
            room_id,
            span,
            kind: RestrictionKind::Reservation,
            reservation_id: Some(reservation_id),
        }
    }

    pub fn block(room_id: RoomId, day: NaiveDate) -> Self {
        Self {
            room_id,
            span: DateSpan::day(day),
            kind: RestrictionKind::Block,
            reservation_id: None,
        }
    }
}

/// In-memory row set for one room: the room itself plus its restrictions,
/// sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub restrictions: Vec<RoomRestriction>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            restrictions: Vec::new(),
        }
    }

    /// Insert restriction maintaining sort order by span.start.
    pub fn insert_restriction(&mut self, restriction: RoomRestriction) {
        let pos = self
            .restrictions
            .partition_point(|r| r.span.start <= restriction.span.start);
        self.restrictions.insert(pos, restriction);
    }

    pub fn remove_restriction(&mut self, id: RestrictionId) -> Option<RoomRestriction> {
        let pos = self.restrictions.iter().position(|r| r.id == id)?;
        Some(self.restrictions.remove(pos))
    }

    pub fn remove_for_reservation(&mut self, reservation_id: ReservationId) -> Vec<RestrictionId> {
        let mut removed = Vec::new();
        self.restrictions.retain(|r| {
            if r.reservation_id == Some(reservation_id) {
                removed.push(r.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Rows satisfying the booking overlap predicate against `query`.
    /// Rows starting at or after `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &RoomRestriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.span.start < query.end);
        let query = *query;
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| query.overlaps(&r.span))
    }

    /// Rows satisfying the calendar inclusion predicate against `query`.
    pub fn touching(&self, query: &DateSpan) -> impl Iterator<Item = &RoomRestriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.span.start <= query.end);
        let query = *query;
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| query.touches(&r.span))
    }
}

/// The event types, flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: RoomId,
        name: String,
        at: DateTime<Utc>,
    },
    ReservationInserted {
        id: ReservationId,
        room_id: RoomId,
        guest: GuestDetails,
        span: DateSpan,
        at: DateTime<Utc>,
    },
    ReservationUpdated {
        id: ReservationId,
        guest: GuestDetails,
        at: DateTime<Utc>,
    },
    ReservationProcessed {
        id: ReservationId,
        processed: bool,
        at: DateTime<Utc>,
    },
    ReservationDeleted {
        id: ReservationId,
    },
    RestrictionInserted {
        id: RestrictionId,
        room_id: RoomId,
        span: DateSpan,
        kind: RestrictionKind,
        reservation_id: Option<ReservationId>,
        at: DateTime<Utc>,
    },
    RestrictionDeleted {
        id: RestrictionId,
        room_id: RoomId,
    },
    UserCreated {
        id: UserId,
        profile: UserProfile,
        password_hash: String,
        at: DateTime<Utc>,
    },
    UserUpdated {
        id: UserId,
        profile: UserProfile,
        at: DateTime<Utc>,
    },
    /// Highest id ever handed out per table. Written by compaction so ids of
    /// deleted rows are not reissued after a restart.
    SequencesAt {
        room: RoomId,
        reservation: ReservationId,
        restriction: RestrictionId,
        user: UserId,
    },
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn span(a: &str, b: &str) -> DateSpan {
        DateSpan::new(d(a), d(b))
    }

    fn room_state() -> RoomState {
        let now = Utc::now();
        RoomState::new(Room {
            id: 1,
            name: "General's Quarters".into(),
            created_at: now,
            updated_at: now,
        })
    }

    fn restriction(
        id: RestrictionId,
        s: DateSpan,
        reservation_id: Option<ReservationId>,
    ) -> RoomRestriction {
        let now = Utc::now();
        RoomRestriction {
            id,
            room_id: 1,
            span: s,
            kind: if reservation_id.is_some() {
                RestrictionKind::Reservation
            } else {
                RestrictionKind::Block
            },
            reservation_id,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn span_basics() {
        let s = span("2024-03-10", "2024-03-12");
        assert_eq!(s.nights(), 2);
        assert!(s.contains_day(d("2024-03-10")));
        assert!(s.contains_day(d("2024-03-11")));
        assert!(!s.contains_day(d("2024-03-12"))); // half-open
        assert!(DateSpan::day(d("2024-03-10")).is_empty());
    }

    #[test]
    fn span_overlap_boundaries() {
        let booked = span("2024-03-10", "2024-03-12");
        // touching on either side is free
        assert!(!span("2024-03-12", "2024-03-14").overlaps(&booked));
        assert!(!span("2024-03-08", "2024-03-10").overlaps(&booked));
        // one night inside either edge
        assert!(span("2024-03-11", "2024-03-13").overlaps(&booked));
        assert!(span("2024-03-09", "2024-03-11").overlaps(&booked));
        // containment both ways
        assert!(span("2024-03-01", "2024-03-31").overlaps(&booked));
        assert!(span("2024-03-10", "2024-03-11").overlaps(&booked));
        // zero-length query never overlaps
        assert!(!DateSpan::day(d("2024-03-11")).overlaps(&booked));
    }

    #[test]
    fn touches_is_inclusive_on_trailing_edge() {
        let month = span("2024-03-01", "2024-03-31");
        // block starting on the last day of the range is included
        assert!(month.touches(&span("2024-03-31", "2024-04-02")));
        assert!(!month.overlaps(&span("2024-03-31", "2024-04-02")));
        // block ending on the first day is excluded on the leading edge
        assert!(!month.touches(&span("2024-02-27", "2024-03-01")));
        // zero-length block on the first day is excluded too
        assert!(!month.touches(&DateSpan::day(d("2024-03-01"))));
        assert!(month.touches(&DateSpan::day(d("2024-03-05"))));
    }

    #[test]
    fn days_inclusive_covers_end() {
        let days: Vec<_> = span("2024-04-01", "2024-04-03").days_inclusive().collect();
        assert_eq!(days, vec![d("2024-04-01"), d("2024-04-02"), d("2024-04-03")]);
        let single: Vec<_> = DateSpan::day(d("2024-03-05")).days_inclusive().collect();
        assert_eq!(single, vec![d("2024-03-05")]);
    }

    #[test]
    fn kind_tags() {
        assert_eq!(RestrictionKind::Reservation.tag(), 1);
        assert_eq!(RestrictionKind::Block.tag(), 2);
        assert_eq!(RestrictionKind::from_tag(2), Some(RestrictionKind::Block));
        assert_eq!(RestrictionKind::from_tag(7), None);
    }

    #[test]
    fn null_reservation_id_reads_as_block() {
        let block = restriction(1, span("2024-03-05", "2024-03-05"), None);
        assert_eq!(block.reservation_id_or_zero(), 0);
        assert!(block.is_block());
        let res = restriction(2, span("2024-03-05", "2024-03-07"), Some(9));
        assert!(!res.is_block());
    }

    #[test]
    fn restriction_ordering() {
        let mut rs = room_state();
        rs.insert_restriction(restriction(1, span("2024-03-20", "2024-03-22"), None));
        rs.insert_restriction(restriction(2, span("2024-03-01", "2024-03-02"), None));
        rs.insert_restriction(restriction(3, span("2024-03-10", "2024-03-12"), Some(4)));
        let starts: Vec<_> = rs.restrictions.iter().map(|r| r.id).collect();
        assert_eq!(starts, vec![2, 3, 1]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = room_state();
        rs.insert_restriction(restriction(1, span("2024-03-10", "2024-03-12"), Some(1)));
        let hits: Vec<_> = rs.overlapping(&span("2024-03-12", "2024-03-14")).collect();
        assert!(hits.is_empty());
        let hits: Vec<_> = rs.overlapping(&span("2024-03-11", "2024-03-14")).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = room_state();
        rs.insert_restriction(restriction(1, span("2024-01-01", "2024-01-05"), None));
        rs.insert_restriction(restriction(2, span("2024-03-09", "2024-03-11"), None));
        rs.insert_restriction(restriction(3, span("2024-06-01", "2024-06-05"), None));
        let hits: Vec<_> = rs
            .overlapping(&span("2024-03-10", "2024-03-20"))
            .map(|r| r.id)
            .collect();
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn remove_for_reservation_only_touches_linked_rows() {
        let mut rs = room_state();
        rs.insert_restriction(restriction(1, span("2024-03-01", "2024-03-03"), Some(7)));
        rs.insert_restriction(restriction(2, span("2024-03-05", "2024-03-05"), None));
        assert_eq!(rs.remove_for_reservation(7), vec![1]);
        assert_eq!(rs.restrictions.len(), 1);
        assert!(rs.remove_restriction(99).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RestrictionInserted {
            id: 3,
            room_id: 1,
            span: span("2024-03-10", "2024-03-12"),
            kind: RestrictionKind::Reservation,
            reservation_id: Some(5),
            at: Utc::now(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
