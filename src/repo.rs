use async_trait::async_trait;
use chrono::NaiveDate;

use crate::model::*;
use crate::store::{Store, StoreError};

/// Persistence surface consumed by the availability, booking and calendar
/// engines.
#[async_trait]
pub trait BookingRepo: Send + Sync {
    async fn all_rooms(&self) -> Result<Vec<Room>, StoreError>;
    async fn get_room(&self, id: RoomId) -> Result<Room, StoreError>;

    async fn restrictions_overlapping(
        &self,
        room_id: RoomId,
        span: DateSpan,
    ) -> Result<usize, StoreError>;
    async fn rooms_free_for(&self, span: DateSpan) -> Result<Vec<Room>, StoreError>;
    async fn restrictions_for_room_in_range(
        &self,
        room_id: RoomId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RoomRestriction>, StoreError>;

    async fn insert_restriction(&self, new: NewRestriction) -> Result<RestrictionId, StoreError>;
    async fn insert_restriction_exclusive(
        &self,
        new: NewRestriction,
    ) -> Result<RestrictionId, StoreError>;
    async fn insert_block_for_room(
        &self,
        room_id: RoomId,
        day: NaiveDate,
    ) -> Result<RestrictionId, StoreError>;
    async fn delete_restriction(&self, id: RestrictionId) -> Result<(), StoreError>;

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId, StoreError>;
    async fn get_reservation(&self, id: ReservationId) -> Result<Reservation, StoreError>;
    async fn update_reservation(
        &self,
        id: ReservationId,
        guest: GuestDetails,
    ) -> Result<(), StoreError>;
    async fn delete_reservation(&self, id: ReservationId) -> Result<(), StoreError>;
    async fn set_processed(&self, id: ReservationId, processed: bool) -> Result<(), StoreError>;
    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError>;
    async fn new_reservations(&self) -> Result<Vec<Reservation>, StoreError>;

    async fn insert_user(
        &self,
        profile: UserProfile,
        password_hash: String,
    ) -> Result<UserId, StoreError>;
    async fn get_user(&self, id: UserId) -> Result<User, StoreError>;
    async fn update_user(&self, id: UserId, profile: UserProfile) -> Result<(), StoreError>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
}

#[async_trait]
impl BookingRepo for Store {
    async fn all_rooms(&self) -> Result<Vec<Room>, StoreError> {
        self.instrumented("all_rooms", Store::all_rooms(self)).await
    }

    async fn get_room(&self, id: RoomId) -> Result<Room, StoreError> {
        self.instrumented("get_room", Store::get_room(self, id)).await
    }

    async fn restrictions_overlapping(
        &self,
        room_id: RoomId,
        span: DateSpan,
    ) -> Result<usize, StoreError> {
        self.instrumented(
            "restrictions_overlapping",
            Store::restrictions_overlapping(self, room_id, span),
        )
        .await
    }

    async fn rooms_free_for(&self, span: DateSpan) -> Result<Vec<Room>, StoreError> {
        self.instrumented("rooms_free_for", Store::rooms_free_for(self, span)).await
    }

    async fn restrictions_for_room_in_range(
        &self,
        room_id: RoomId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RoomRestriction>, StoreError> {
        self.instrumented(
            "restrictions_for_room_in_range",
            Store::restrictions_for_room_in_range(self, room_id, start, end),
        )
        .await
    }

    async fn insert_restriction(&self, new: NewRestriction) -> Result<RestrictionId, StoreError> {
        self.instrumented("insert_restriction", Store::insert_restriction(self, new)).await
    }

    async fn insert_restriction_exclusive(
        &self,
        new: NewRestriction,
    ) -> Result<RestrictionId, StoreError> {
        self.instrumented(
            "insert_restriction_exclusive",
            Store::insert_restriction_exclusive(self, new),
        )
        .await
    }

    async fn insert_block_for_room(
        &self,
        room_id: RoomId,
        day: NaiveDate,
    ) -> Result<RestrictionId, StoreError> {
        self.instrumented(
            "insert_block_for_room",
            Store::insert_block_for_room(self, room_id, day),
        )
        .await
    }

    async fn delete_restriction(&self, id: RestrictionId) -> Result<(), StoreError> {
        self.instrumented("delete_restriction", Store::delete_restriction(self, id)).await
    }

    async fn insert_reservation(&self, new: NewReservation) -> Result<ReservationId, StoreError> {
        self.instrumented("insert_reservation", Store::insert_reservation(self, new)).await
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        self.instrumented("get_reservation", Store::get_reservation(self, id)).await
    }

    async fn update_reservation(
        &self,
        id: ReservationId,
        guest: GuestDetails,
    ) -> Result<(), StoreError> {
        self.instrumented(
            "update_reservation",
            Store::update_reservation(self, id, guest),
        )
        .await
    }

    async fn delete_reservation(&self, id: ReservationId) -> Result<(), StoreError> {
        self.instrumented("delete_reservation", Store::delete_reservation(self, id)).await
    }

    async fn set_processed(&self, id: ReservationId, processed: bool) -> Result<(), StoreError> {
        self.instrumented("set_processed", Store::set_processed(self, id, processed)).await
    }

    async fn all_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        self.instrumented("all_reservations", Store::all_reservations(self)).await
    }

    async fn new_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        self.instrumented("new_reservations", Store::new_reservations(self)).await
    }

    async fn insert_user(
        &self,
        profile: UserProfile,
        password_hash: String,
    ) -> Result<UserId, StoreError> {
        self.instrumented(
            "insert_user",
            Store::insert_user(self, profile, password_hash),
        )
        .await
    }

    async fn get_user(&self, id: UserId) -> Result<User, StoreError> {
        self.instrumented("get_user", Store::get_user(self, id)).await
    }

    async fn update_user(&self, id: UserId, profile: UserProfile) -> Result<(), StoreError> {
        self.instrumented("update_user", Store::update_user(self, id, profile)).await
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.instrumented("user_by_email", Store::user_by_email(self, email)).await
    }
}
