use std::collections::HashSet;

use chrono::NaiveDate;

use crate::model::*;

use super::{Deadline, Store, StoreError};

impl Store {
    pub async fn all_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let deadline = self.deadline();
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(handles.len());
        for rs in handles {
            let guard = self.bounded("all_rooms", deadline, rs.read()).await?;
            rooms.push(guard.room.clone());
        }
        rooms.sort_by_key(|r| r.id);
        Ok(rooms)
    }

    pub async fn get_room(&self, id: RoomId) -> Result<Room, StoreError> {
        let deadline = self.deadline();
        let rs = self
            .room_handle(id)
            .ok_or(StoreError::NotFound { entity: "room", id })?;
        let guard = self.bounded("get_room", deadline, rs.read()).await?;
        Ok(guard.room.clone())
    }

    /// Count of rows on `room_id` satisfying `span.start < row.end && span.end > row.start`.
    /// An unknown room has no rows and counts 0.
    pub async fn restrictions_overlapping(
        &self,
        room_id: RoomId,
        span: DateSpan,
    ) -> Result<usize, StoreError> {
        let deadline = self.deadline();
        let Some(rs) = self.room_handle(room_id) else {
            return Ok(0);
        };
        let guard = self
            .bounded("restrictions_overlapping", deadline, rs.read())
            .await?;
        let count = guard.overlapping(&span).count();
        tracing::debug!(room_id, start = %span.start, end = %span.end, count, "overlap count");
        Ok(count)
    }

    /// Inventory minus the rooms that have any row overlapping `span`.
    pub async fn rooms_free_for(&self, span: DateSpan) -> Result<Vec<Room>, StoreError> {
        let deadline = self.deadline();
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut inventory = Vec::with_capacity(handles.len());
        let mut busy: HashSet<RoomId> = HashSet::new();
        for rs in handles {
            let guard = self.bounded("rooms_free_for", deadline, rs.read()).await?;
            if guard.overlapping(&span).next().is_some() {
                busy.insert(guard.room.id);
            }
            inventory.push(guard.room.clone());
        }
        let mut free: Vec<Room> = inventory
            .into_iter()
            .filter(|room| !busy.contains(&room.id))
            .collect();
        free.sort_by_key(|r| r.id);
        Ok(free)
    }

    /// Rows on `room_id` with `start < row.end && end >= row.start`. The
    /// inclusive trailing edge keeps rows that begin on `end` itself.
    pub async fn restrictions_for_room_in_range(
        &self,
        room_id: RoomId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RoomRestriction>, StoreError> {
        let deadline = self.deadline();
        let Some(rs) = self.room_handle(room_id) else {
            return Ok(Vec::new());
        };
        let guard = self
            .bounded("restrictions_for_room_in_range", deadline, rs.read())
            .await?;
        Ok(guard
            .touching(&DateSpan::new(start, end))
            .cloned()
            .collect())
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        let deadline = self.deadline();
        let mut reservation = self
            .reservations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound {
                entity: "reservation",
                id,
            })?;
        self.join_room_name(std::slice::from_mut(&mut reservation), deadline)
            .await?;
        Ok(reservation)
    }

    /// Every reservation, ordered by start date.
    pub async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        self.list_reservations(|_| true).await
    }

    /// Reservations not yet processed, ordered by start date.
    pub async fn new_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        self.list_reservations(|r| !r.processed).await
    }

    async fn list_reservations(
        &self,
        keep: impl Fn(&Reservation) -> bool,
    ) -> Result<Vec<Reservation>, StoreError> {
        let deadline = self.deadline();
        let mut rows: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.span.start, r.id));
        self.join_room_name(&mut rows, deadline).await?;
        Ok(rows)
    }

    async fn join_room_name(
        &self,
        rows: &mut [Reservation],
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        for row in rows.iter_mut() {
            if let Some(rs) = self.room_handle(row.room_id) {
                let guard = self.bounded("join_room_name", deadline, rs.read()).await?;
                row.room_name = guard.room.name.clone();
            }
        }
        Ok(())
    }

    pub async fn restriction_count(&self, room_id: RoomId) -> Result<usize, StoreError> {
        let deadline = self.deadline();
        let Some(rs) = self.room_handle(room_id) else {
            return Ok(0);
        };
        let guard = self
            .bounded("restriction_count", deadline, rs.read())
            .await?;
        Ok(guard.restrictions.len())
    }

    pub async fn get_user(&self, id: UserId) -> Result<User, StoreError> {
        self.users
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound { entity: "user", id })
    }

    /// Account whose email matches `email`, ignoring ASCII case.
    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.trim();
        Ok(self
            .users
            .iter()
            .find(|e| e.value().profile.email.eq_ignore_ascii_case(email))
            .map(|e| e.value().clone()))
    }
}
