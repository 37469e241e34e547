use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::{RwLock, oneshot};

use crate::limits::*;
use crate::model::*;

use super::{Store, StoreError, WalCommand, apply_to_users};

fn validate_span(span: &DateSpan) -> Result<(), StoreError> {
    if span.end < span.start {
        return Err(StoreError::InvalidSpan(*span));
    }
    if span.nights() > MAX_SPAN_DAYS {
        return Err(StoreError::LimitExceeded("span too wide"));
    }
    Ok(())
}

fn validate_guest(guest: &GuestDetails) -> Result<(), StoreError> {
    let fields = [
        &guest.first_name,
        &guest.last_name,
        &guest.email,
        &guest.phone,
    ];
    if fields.iter().any(|f| f.len() > MAX_GUEST_FIELD_LEN) {
        return Err(StoreError::LimitExceeded("guest field too long"));
    }
    Ok(())
}

fn validate_profile(profile: &UserProfile) -> Result<(), StoreError> {
    let fields = [&profile.first_name, &profile.last_name, &profile.email];
    if fields.iter().any(|f| f.len() > MAX_GUEST_FIELD_LEN) {
        return Err(StoreError::LimitExceeded("user field too long"));
    }
    if profile.email.trim().is_empty() {
        return Err(StoreError::InvalidRow("user without email"));
    }
    Ok(())
}

/// Reservation rows carry a reservation id; block rows never do.
fn validate_tagging(new: &NewRestriction) -> Result<(), StoreError> {
    match (new.kind, new.reservation_id) {
        (RestrictionKind::Reservation, Some(id)) if id > 0 => Ok(()),
        (RestrictionKind::Reservation, _) => Err(StoreError::InvalidRow(
            "reservation restriction without reservation id",
        )),
        (RestrictionKind::Block, None) => Ok(()),
        (RestrictionKind::Block, Some(_)) => {
            Err(StoreError::InvalidRow("block restriction with reservation id"))
        }
    }
}

impl Store {
    /// Add a room to the inventory.
    pub async fn insert_room(&self, name: &str) -> Result<RoomId, StoreError> {
        if name.len() > MAX_ROOM_NAME_LEN {
            return Err(StoreError::LimitExceeded("room name too long"));
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(StoreError::LimitExceeded("too many rooms"));
        }
        let deadline = self.deadline();
        let _gate = self
            .bounded("insert_room", deadline, self.write_gate.read())
            .await?;
        let id = self.seq.next_room();
        let at = Utc::now();
        let event = Event::RoomCreated {
            id,
            name: name.to_string(),
            at,
        };
        self.wal_append(&event, deadline).await?;
        let room = Room {
            id,
            name: name.to_string(),
            created_at: at,
            updated_at: at,
        };
        self.rooms.insert(id, Arc::new(RwLock::new(RoomState::new(room))));
        tracing::info!(room_id = id, name, "room created");
        Ok(id)
    }

    pub async fn insert_reservation(
        &self,
        new: NewReservation,
    ) -> Result<ReservationId, StoreError> {
        validate_span(&new.span)?;
        validate_guest(&new.guest)?;
        let deadline = self.deadline();
        let _gate = self
            .bounded("insert_reservation", deadline, self.write_gate.read())
            .await?;
        let mut guard = self
            .lock_room_write("insert_reservation", deadline, new.room_id)
            .await?;

        let id = self.seq.next_reservation();
        let event = Event::ReservationInserted {
            id,
            room_id: new.room_id,
            guest: new.guest,
            span: new.span,
            at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event, deadline).await?;
        tracing::info!(reservation_id = id, room_id = new.room_id, "reservation inserted");
        Ok(id)
    }

    /// Raw insert. Overlap with existing rows is not checked.
    pub async fn insert_restriction(
        &self,
        new: NewRestriction,
    ) -> Result<RestrictionId, StoreError> {
        self.insert_restriction_inner(new, false).await
    }

    /// Insert that refuses to create an overlap on the room. The check and
    /// the write happen under the room's write lock.
    pub async fn insert_restriction_exclusive(
        &self,
        new: NewRestriction,
    ) -> Result<RestrictionId, StoreError> {
        self.insert_restriction_inner(new, true).await
    }

    async fn insert_restriction_inner(
        &self,
        new: NewRestriction,
        exclusive: bool,
    ) -> Result<RestrictionId, StoreError> {
        validate_span(&new.span)?;
        validate_tagging(&new)?;
        let deadline = self.deadline();
        let _gate = self
            .bounded("insert_restriction", deadline, self.write_gate.read())
            .await?;
        let mut guard = self
            .lock_room_write("insert_restriction", deadline, new.room_id)
            .await?;
        if guard.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
            return Err(StoreError::LimitExceeded("too many restrictions on room"));
        }
        if exclusive && let Some(existing) = guard.overlapping(&new.span).next() {
            return Err(StoreError::Overlap {
                room_id: new.room_id,
                conflicting: existing.id,
            });
        }

        let id = self.seq.next_restriction();
        let event = Event::RestrictionInserted {
            id,
            room_id: new.room_id,
            span: new.span,
            kind: new.kind,
            reservation_id: new.reservation_id,
            at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event, deadline).await?;
        tracing::info!(
            restriction_id = id,
            room_id = new.room_id,
            start = %new.span.start,
            end = %new.span.end,
            kind = ?new.kind,
            "restriction inserted"
        );
        Ok(id)
    }

    /// Single-day admin block `[day, day]` on `room_id`.
    pub async fn insert_block_for_room(
        &self,
        room_id: RoomId,
        day: NaiveDate,
    ) -> Result<RestrictionId, StoreError> {
        self.insert_restriction(NewRestriction::block(room_id, day)).await
    }

    /// Delete by id. A missing id is not an error.
    pub async fn delete_restriction(&self, id: RestrictionId) -> Result<(), StoreError> {
        let deadline = self.deadline();
        let _gate = self
            .bounded("delete_restriction", deadline, self.write_gate.read())
            .await?;
        let Some(room_id) = self.restriction_to_room.get(&id).map(|e| *e.value()) else {
            tracing::debug!(restriction_id = id, "delete of missing restriction ignored");
            return Ok(());
        };
        let mut guard = self
            .lock_room_write("delete_restriction", deadline, room_id)
            .await?;
        // Re-check under the lock: a concurrent delete may have won.
        if !guard.restrictions.iter().any(|r| r.id == id) {
            return Ok(());
        }
        let event = Event::RestrictionDeleted { id, room_id };
        self.persist_and_apply(&mut guard, &event, deadline).await?;
        tracing::info!(restriction_id = id, room_id, "restriction deleted");
        Ok(())
    }

    /// Overwrite the guest fields. Dates and room are not editable.
    pub async fn update_reservation(
        &self,
        id: ReservationId,
        guest: GuestDetails,
    ) -> Result<(), StoreError> {
        validate_guest(&guest)?;
        let deadline = self.deadline();
        let _gate = self
            .bounded("update_reservation", deadline, self.write_gate.read())
            .await?;
        let room_id = self.reservation_room(id)?;
        let mut guard = self
            .lock_room_write("update_reservation", deadline, room_id)
            .await?;
        self.reservation_room(id)?;
        let event = Event::ReservationUpdated {
            id,
            guest,
            at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event, deadline).await
    }

    pub async fn set_processed(
        &self,
        id: ReservationId,
        processed: bool,
    ) -> Result<(), StoreError> {
        let deadline = self.deadline();
        let _gate = self
            .bounded("set_processed", deadline, self.write_gate.read())
            .await?;
        let room_id = self.reservation_room(id)?;
        let mut guard = self
            .lock_room_write("set_processed", deadline, room_id)
            .await?;
        self.reservation_room(id)?;
        let event = Event::ReservationProcessed {
            id,
            processed,
            at: Utc::now(),
        };
        self.persist_and_apply(&mut guard, &event, deadline).await?;
        tracing::info!(reservation_id = id, processed, "reservation processed flag set");
        Ok(())
    }

    /// Delete a reservation and every restriction referencing it. A missing
    /// id is not an error.
    pub async fn delete_reservation(&self, id: ReservationId) -> Result<(), StoreError> {
        let deadline = self.deadline();
        let _gate = self
            .bounded("delete_reservation", deadline, self.write_gate.read())
            .await?;
        let room_id = match self.reservation_room(id) {
            Ok(room_id) => room_id,
            Err(_) => return Ok(()),
        };
        let mut guard = self
            .lock_room_write("delete_reservation", deadline, room_id)
            .await?;
        if !self.reservations.contains_key(&id) {
            return Ok(());
        }
        let event = Event::ReservationDeleted { id };
        self.persist_and_apply(&mut guard, &event, deadline).await?;
        tracing::info!(reservation_id = id, room_id, "reservation deleted");
        Ok(())
    }

    fn reservation_room(&self, id: ReservationId) -> Result<RoomId, StoreError> {
        self.reservations
            .get(&id)
            .map(|e| e.value().room_id)
            .ok_or(StoreError::NotFound {
                entity: "reservation",
                id,
            })
    }

    /// Add an admin account. `password_hash` must already be hashed. Emails
    /// are unique, ignoring ASCII case.
    pub async fn insert_user(
        &self,
        profile: UserProfile,
        password_hash: String,
    ) -> Result<UserId, StoreError> {
        validate_profile(&profile)?;
        let deadline = self.deadline();
        let _gate = self
            .bounded("insert_user", deadline, self.write_gate.read())
            .await?;
        let _users = self
            .bounded("insert_user", deadline, self.users_lock.lock())
            .await?;
        self.ensure_email_free(&profile.email, None)?;

        let id = self.seq.next_user();
        let event = Event::UserCreated {
            id,
            profile,
            password_hash,
            at: Utc::now(),
        };
        self.wal_append(&event, deadline).await?;
        apply_to_users(&self.users, &event);
        tracing::info!(user_id = id, "user created");
        Ok(id)
    }

    /// Overwrite the profile fields. The password hash is left alone.
    pub async fn update_user(&self, id: UserId, profile: UserProfile) -> Result<(), StoreError> {
        validate_profile(&profile)?;
        let deadline = self.deadline();
        let _gate = self
            .bounded("update_user", deadline, self.write_gate.read())
            .await?;
        let _users = self
            .bounded("update_user", deadline, self.users_lock.lock())
            .await?;
        if !self.users.contains_key(&id) {
            return Err(StoreError::NotFound { entity: "user", id });
        }
        self.ensure_email_free(&profile.email, Some(id))?;

        let event = Event::UserUpdated {
            id,
            profile,
            at: Utc::now(),
        };
        self.wal_append(&event, deadline).await?;
        apply_to_users(&self.users, &event);
        tracing::info!(user_id = id, "user updated");
        Ok(())
    }

    fn ensure_email_free(&self, email: &str, owner: Option<UserId>) -> Result<(), StoreError> {
        let email = email.trim();
        let taken = self.users.iter().any(|e| {
            Some(e.value().id) != owner && e.value().profile.email.eq_ignore_ascii_case(email)
        });
        if taken {
            return Err(StoreError::Duplicate {
                entity: "user",
                key: email.to_string(),
            });
        }
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state,
    /// led by the sequence high-water marks.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let deadline = self.deadline();
        let _gate = self
            .bounded("compact_wal", deadline, self.write_gate.write())
            .await?;
        let mut events = vec![self.seq.snapshot()];

        let mut room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort_unstable();
        let mut restrictions = Vec::new();
        for room_id in &room_ids {
            let Some(rs) = self.room_handle(*room_id) else {
                continue;
            };
            let guard = self.bounded("compact_wal", deadline, rs.read()).await?;
            events.push(Event::RoomCreated {
                id: guard.room.id,
                name: guard.room.name.clone(),
                at: guard.room.created_at,
            });
            restrictions.extend(guard.restrictions.iter().cloned());
        }

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for u in users {
            events.push(Event::UserCreated {
                id: u.id,
                profile: u.profile.clone(),
                password_hash: u.password_hash,
                at: u.created_at,
            });
            if u.updated_at != u.created_at {
                events.push(Event::UserUpdated {
                    id: u.id,
                    profile: u.profile,
                    at: u.updated_at,
                });
            }
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        let live_reservations: HashSet<ReservationId> =
            reservations.iter().map(|r| r.id).collect();
        for r in reservations {
            events.push(Event::ReservationInserted {
                id: r.id,
                room_id: r.room_id,
                guest: r.guest.clone(),
                span: r.span,
                at: r.created_at,
            });
            if r.processed {
                events.push(Event::ReservationProcessed {
                    id: r.id,
                    processed: true,
                    at: r.updated_at,
                });
            } else if r.updated_at != r.created_at {
                events.push(Event::ReservationUpdated {
                    id: r.id,
                    guest: r.guest,
                    at: r.updated_at,
                });
            }
        }

        restrictions.sort_by_key(|r| r.id);
        for r in restrictions {
            if let Some(res_id) = r.reservation_id
                && !live_reservations.contains(&res_id)
            {
                tracing::warn!(
                    restriction_id = r.id,
                    reservation_id = res_id,
                    "restriction references missing reservation"
                );
            }
            events.push(Event::RestrictionInserted {
                id: r.id,
                room_id: r.room_id,
                span: r.span,
                kind: r.kind,
                reservation_id: r.reservation_id,
                at: r.created_at,
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        let command = WalCommand::Compact {
            events,
            response: tx,
        };
        self.bounded("compact_wal", deadline, self.wal_tx.send(command))
            .await?
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
