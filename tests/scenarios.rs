use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use ulid::Ulid;

use bookings::auth::Authenticator;
use bookings::availability::AvailabilityEngine;
use bookings::booking::{BookingError, MailSettings, ReservationDraft, ReservationEngine};
use bookings::calendar::{CalendarEngine, CalendarPost, MonthAnchor};
use bookings::form::LoginForm;
use bookings::mail::MailQueue;
use bookings::model::*;
use bookings::session::{Authenticated, FlashKind, SessionError, SessionStore};
use bookings::store::Store;

const ADMIN_EMAIL: &str = "admin@here.com";
const ADMIN_PASSWORD: &str = "correct horse";

// ── Test infrastructure ──────────────────────────────────────

struct Harness {
    store: Arc<Store>,
    sessions: Arc<SessionStore>,
    availability: AvailabilityEngine,
    reservations: ReservationEngine,
    calendar: CalendarEngine,
    auth: Authenticator,
    wal_path: PathBuf,
}

impl Harness {
    /// Log a fresh session in as the seeded admin.
    async fn admin(&self) -> Authenticated {
        let form = LoginForm {
            email: ADMIN_EMAIL.into(),
            password: ADMIN_PASSWORD.into(),
        };
        self.auth.login(self.sessions.create(), &form).await.unwrap()
    }
}

async fn start(rooms: &[&str]) -> Harness {
    let dir = std::env::temp_dir().join(format!("bookings_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join("bookings.wal");
    let store = Arc::new(Store::open(wal_path.clone()).unwrap());
    for name in rooms {
        store.insert_room(name).await.unwrap();
    }
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(60)));
    let (mail, _rx) = MailQueue::new(16);
    let auth = Authenticator::with_cost(store.clone(), sessions.clone(), 4);
    let admin = UserProfile {
        first_name: "Admin".into(),
        last_name: "User".into(),
        email: ADMIN_EMAIL.into(),
        access_level: 3,
    };
    auth.register(admin, ADMIN_PASSWORD).await.unwrap();
    Harness {
        availability: AvailabilityEngine::new(store.clone()),
        reservations: ReservationEngine::new(
            store.clone(),
            mail,
            MailSettings {
                from: "me@here.com".into(),
                owner_email: "me@here.com".into(),
            },
        ),
        calendar: CalendarEngine::new(store.clone(), sessions.clone()),
        auth,
        store,
        sessions,
        wal_path,
    }
}

fn d(s: &str) -> NaiveDate {
    parse_date(s).unwrap()
}

fn guest() -> GuestDetails {
    GuestDetails {
        first_name: "Jane".into(),
        last_name: "Doe".into(),
        email: "jane@doe.com".into(),
        phone: "555-0100".into(),
    }
}

fn room_ids(rooms: &[Room]) -> Vec<RoomId> {
    rooms.iter().map(|r| r.id).collect()
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn search_excludes_restricted_room_until_checkout_day() {
    let h = start(&["General's Quarters", "Major's Suite"]).await;
    h.store
        .insert_restriction(NewRestriction {
            room_id: 1,
            span: DateSpan::new(d("2024-03-10"), d("2024-03-12")),
            kind: RestrictionKind::Block,
            reservation_id: None,
        })
        .await
        .unwrap();

    let during = h.availability.search_all_rooms(d("2024-03-10"), d("2024-03-12")).await.unwrap();
    assert_eq!(room_ids(&during), vec![2]);

    let after = h.availability.search_all_rooms(d("2024-03-12"), d("2024-03-14")).await.unwrap();
    assert_eq!(room_ids(&after), vec![1, 2]);
}

#[tokio::test]
async fn booked_nights_unavailable_and_following_nights_free() {
    let h = start(&["General's Quarters", "Major's Suite"]).await;
    let draft = ReservationDraft {
        room_id: 1,
        span: DateSpan::new(d("2024-04-01"), d("2024-04-03")),
        room_name: "General's Quarters".into(),
    };
    let id = h.reservations.book(&draft, guest()).await.unwrap();
    assert!(id > 0);

    assert!(!h.availability.is_room_free(1, d("2024-04-01"), d("2024-04-03")).await.unwrap());
    assert!(h.availability.is_room_free(1, d("2024-04-03"), d("2024-04-05")).await.unwrap());

    let admin = h.admin().await;
    let booked = h.reservations.get(&admin, id).await.unwrap();
    assert_eq!(booked.room_name, "General's Quarters");
    assert_eq!(booked.guest, guest());
}

#[tokio::test]
async fn unchecked_calendar_block_is_deleted() {
    let h = start(&["General's Quarters", "Major's Suite"]).await;
    let block = h.store.insert_block_for_room(2, d("2024-03-05")).await.unwrap();
    let admin = h.admin().await;
    let march = MonthAnchor::new(2024, 3).unwrap();

    let view = h.calendar.render(&admin, march).await.unwrap();
    let room2 = view.rooms.iter().find(|r| r.room.id == 2).unwrap();
    assert_eq!(room2.block_day[&d("2024-03-05")], block);

    // Every other kept marker is posted back; March 5 is not.
    let mut post = CalendarPost::unchanged(&[h.sessions.snapshot(admin.session(), 2).unwrap()]);
    post.unkeep(2, d("2024-03-05"));
    let fields = post.field_names();
    let posted = CalendarPost::parse(fields.iter().map(String::as_str));
    let applied = h.calendar.reconcile(&admin, &posted).await.unwrap();
    assert!(applied.deletes.contains(&block));

    let view = h.calendar.render(&admin, march).await.unwrap();
    let room2 = view.rooms.iter().find(|r| r.room.id == 2).unwrap();
    assert_eq!(room2.block_day[&d("2024-03-05")], 0);
}

#[tokio::test]
async fn zero_length_query_reports_free() {
    let h = start(&["General's Quarters"]).await;
    h.store.insert_block_for_room(1, d("2024-03-05")).await.unwrap();
    h.store
        .insert_restriction(NewRestriction {
            room_id: 1,
            span: DateSpan::new(d("2024-03-10"), d("2024-03-12")),
            kind: RestrictionKind::Block,
            reservation_id: None,
        })
        .await
        .unwrap();
    for day in ["2024-03-05", "2024-03-10", "2024-03-11", "2024-03-12"] {
        assert!(h.availability.is_room_free(1, d(day), d(day)).await.unwrap(), "{day}");
    }
}

#[tokio::test]
async fn untouched_post_back_changes_nothing() {
    let h = start(&["General's Quarters", "Major's Suite"]).await;
    h.store.insert_block_for_room(1, d("2024-03-05")).await.unwrap();
    h.store.insert_block_for_room(2, d("2024-03-20")).await.unwrap();
    let admin = h.admin().await;
    let march = MonthAnchor::new(2024, 3).unwrap();
    h.calendar.render(&admin, march).await.unwrap();

    let snapshots: Vec<_> = [1, 2]
        .into_iter()
        .map(|room| h.sessions.snapshot(admin.session(), room).unwrap())
        .collect();
    let post = CalendarPost::unchanged(&snapshots);
    for _ in 0..2 {
        let applied = h.calendar.reconcile(&admin, &post).await.unwrap();
        assert!(applied.is_empty());
    }
    assert_eq!(h.store.restriction_count(1).await.unwrap(), 1);
    assert_eq!(h.store.restriction_count(2).await.unwrap(), 1);
}

#[tokio::test]
async fn state_survives_restart() {
    let h = start(&["General's Quarters", "Major's Suite"]).await;
    let draft = ReservationDraft {
        room_id: 2,
        span: DateSpan::new(d("2024-05-01"), d("2024-05-04")),
        room_name: "Major's Suite".into(),
    };
    let id = h.reservations.book(&draft, guest()).await.unwrap();
    let admin = h.admin().await;
    h.reservations.set_processed(&admin, id, true).await.unwrap();
    let wal_path = h.wal_path.clone();
    drop(h);

    let store = Arc::new(Store::open(wal_path).unwrap());
    let availability = AvailabilityEngine::new(store.clone());
    assert!(!availability.is_room_free(2, d("2024-05-02"), d("2024-05-03")).await.unwrap());
    let row = store.get_reservation(id).await.unwrap();
    assert!(row.processed);
    assert!(store.new_reservations().await.unwrap().is_empty());

    let sessions = Arc::new(SessionStore::new(Duration::from_secs(60)));
    let auth = Authenticator::with_cost(store.clone(), sessions, 4);
    assert_eq!(auth.authenticate(ADMIN_EMAIL, ADMIN_PASSWORD).await.unwrap(), 1);
}

#[tokio::test]
async fn single_day_block_covers_only_stays_across_it() {
    let h = start(&["General's Quarters"]).await;
    h.store.insert_block_for_room(1, d("2024-03-10")).await.unwrap();

    assert!(!h.availability.is_room_free(1, d("2024-03-09"), d("2024-03-11")).await.unwrap());
    assert!(h.availability.is_room_free(1, d("2024-03-10"), d("2024-03-11")).await.unwrap());

    let across = ReservationDraft {
        room_id: 1,
        span: DateSpan::new(d("2024-03-09"), d("2024-03-11")),
        room_name: "General's Quarters".into(),
    };
    let err = h.reservations.book(&across, guest()).await.unwrap_err();
    assert!(matches!(err, BookingError::Unavailable { room_id: 1 }));
    assert!(h.store.all_reservations().await.unwrap().is_empty());

    let from_block_day = ReservationDraft {
        span: DateSpan::new(d("2024-03-10"), d("2024-03-11")),
        ..across
    };
    h.reservations.book(&from_block_day, guest()).await.unwrap();
}

#[tokio::test]
async fn admin_pages_need_a_login() {
    let h = start(&["General's Quarters"]).await;
    let visitor = h.sessions.create();
    let err = h.sessions.require_user(visitor).unwrap_err();
    assert!(matches!(err, SessionError::Unauthenticated(_)));
    assert_eq!(
        h.sessions.take_flash(visitor, FlashKind::Error).as_deref(),
        Some("Login First!")
    );

    let wrong = LoginForm {
        email: ADMIN_EMAIL.into(),
        password: "guess".into(),
    };
    assert!(h.auth.login(visitor, &wrong).await.is_err());
    assert!(h.sessions.require_user(visitor).is_err());

    let admin = h.admin().await;
    assert!(h.reservations.list_all(&admin).await.unwrap().is_empty());
    let anonymous = h.auth.logout(admin.session());
    assert!(matches!(
        h.sessions.require_user(admin.session()),
        Err(SessionError::NotFound(_))
    ));
    assert!(h.sessions.require_user(anonymous).is_err());
}
