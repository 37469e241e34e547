use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::form::{GuestForm, ValidationError};
use crate::mail::{MailData, MailQueue};
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;
use crate::repo::BookingRepo;
use crate::session::Authenticated;
use crate::store::StoreError;

/// Room and dates chosen by the guest, carried in the session until the
/// guest form is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDraft {
    pub room_id: RoomId,
    pub span: DateSpan,
    pub room_name: String,
}

#[derive(Debug)]
pub enum BookingError {
    Validation(ValidationError),
    NotFound { entity: &'static str, id: i64 },
    /// The room was taken between the availability check and the commit.
    Unavailable { room_id: RoomId },
    Store(StoreError),
    /// The reservation row exists but no restriction blocks its room.
    ConsistencyGap {
        reservation_id: ReservationId,
        source: StoreError,
    },
}

impl BookingError {
    /// Text safe to show an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "Please correct the errors in the form",
            BookingError::NotFound { .. } => "Reservation not found",
            BookingError::Unavailable { .. } => {
                "Sorry, the room is no longer available for those dates"
            }
            BookingError::Store(_) | BookingError::ConsistencyGap { .. } => {
                "Something went wrong, please try again later"
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "invalid",
            BookingError::NotFound { .. } => "not_found",
            BookingError::Unavailable { .. } => "unavailable",
            BookingError::Store(_) => "failed",
            BookingError::ConsistencyGap { .. } => "consistency_gap",
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => BookingError::NotFound { entity, id },
            other => BookingError::Store(other),
        }
    }
}

impl From<ValidationError> for BookingError {
    fn from(e: ValidationError) -> Self {
        BookingError::Validation(e)
    }
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::Validation(e) => write!(f, "invalid guest form: {e}"),
            BookingError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            BookingError::Unavailable { room_id } => {
                write!(f, "room {room_id} is not available for the requested dates")
            }
            BookingError::Store(e) => write!(f, "store error: {e}"),
            BookingError::ConsistencyGap {
                reservation_id,
                source,
            } => write!(
                f,
                "reservation {reservation_id} stored without a room restriction: {source}"
            ),
        }
    }
}

impl std::error::Error for BookingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BookingError::Validation(e) => Some(e),
            BookingError::Store(e) | BookingError::ConsistencyGap { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Sender and owner addresses for booking notifications.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub from: String,
    pub owner_email: String,
}

/// Creates reservations and their room restrictions, and exposes the admin
/// CRUD over reservations.
#[derive(Clone)]
pub struct ReservationEngine {
    repo: Arc<dyn BookingRepo>,
    mail: MailQueue,
    settings: MailSettings,
}

impl ReservationEngine {
    pub fn new(repo: Arc<dyn BookingRepo>, mail: MailQueue, settings: MailSettings) -> Self {
        Self {
            repo,
            mail,
            settings,
        }
    }

    /// Validate the posted guest form, then book.
    pub async fn submit(
        &self,
        draft: &ReservationDraft,
        form: &GuestForm,
    ) -> Result<ReservationId, BookingError> {
        let guest = form.validate().inspect_err(|_| {
            metrics::counter!(BOOKINGS_TOTAL, "status" => "invalid").increment(1);
        })?;
        self.book(draft, guest).await
    }

    /// Insert the reservation, then the restriction that blocks its room.
    ///
    /// The two writes are separate. A conflicting restriction at the second
    /// step undoes the first and reports `Unavailable`; any other failure
    /// there leaves the reservation in place and reports `ConsistencyGap`.
    pub async fn book(
        &self,
        draft: &ReservationDraft,
        guest: GuestDetails,
    ) -> Result<ReservationId, BookingError> {
        let result = self.book_inner(draft, guest).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "status" => status).increment(1);
        result
    }

    async fn book_inner(
        &self,
        draft: &ReservationDraft,
        guest: GuestDetails,
    ) -> Result<ReservationId, BookingError> {
        let new = NewReservation {
            guest: guest.clone(),
            room_id: draft.room_id,
            span: draft.span,
        };
        let reservation_id = self.repo.insert_reservation(new).await.map_err(|e| {
            tracing::error!(room_id = draft.room_id, "cannot insert reservation: {e}");
            BookingError::from(e)
        })?;

        let restriction =
            NewRestriction::for_reservation(draft.room_id, draft.span, reservation_id);
        match self.repo.insert_restriction_exclusive(restriction).await {
            Ok(restriction_id) => {
                tracing::info!(
                    reservation_id,
                    restriction_id,
                    room_id = draft.room_id,
                    start = %draft.span.start,
                    end = %draft.span.end,
                    "reservation booked"
                );
            }
            Err(StoreError::Overlap { conflicting, .. }) => {
                tracing::info!(
                    reservation_id,
                    room_id = draft.room_id,
                    conflicting,
                    "room taken before commit, rolling back reservation"
                );
                return match self.repo.delete_reservation(reservation_id).await {
                    Ok(()) => Err(BookingError::Unavailable {
                        room_id: draft.room_id,
                    }),
                    Err(source) => Err(self.consistency_gap(draft, reservation_id, source)),
                };
            }
            Err(source) => return Err(self.consistency_gap(draft, reservation_id, source)),
        }

        self.notify(draft, &guest);
        Ok(reservation_id)
    }

    fn consistency_gap(
        &self,
        draft: &ReservationDraft,
        reservation_id: ReservationId,
        source: StoreError,
    ) -> BookingError {
        tracing::error!(
            kind = "consistency_gap",
            reservation_id,
            room_id = draft.room_id,
            start = %draft.span.start,
            end = %draft.span.end,
            "reservation has no room restriction: {source}"
        );
        BookingError::ConsistencyGap {
            reservation_id,
            source,
        }
    }

    fn notify(&self, draft: &ReservationDraft, guest: &GuestDetails) {
        let start = format_date(draft.span.start);
        let end = format_date(draft.span.end);
        self.mail.enqueue(MailData {
            to: guest.email.clone(),
            from: self.settings.from.clone(),
            subject: "Reservation Confirmation".into(),
            content: format!(
                "<strong>Reservation Confirmation</strong><br>\
                 Dear {}, <br>\
                 This is to confirm your reservation from {start} to {end}.",
                guest.full_name()
            ),
            template: None,
        });
        self.mail.enqueue(MailData {
            to: self.settings.owner_email.clone(),
            from: self.settings.from.clone(),
            subject: "Reservation Notification".into(),
            content: format!(
                "<strong>Reservation Notification</strong><br>\
                 A reservation has been made for {} from {start} to {end}.",
                draft.room_name
            ),
            template: Some("basic.html".into()),
        });
    }

    pub async fn get(
        &self,
        admin: &Authenticated,
        id: ReservationId,
    ) -> Result<Reservation, BookingError> {
        tracing::debug!(user_id = admin.user_id(), reservation_id = id, "admin reads reservation");
        Ok(self.repo.get_reservation(id).await?)
    }

    /// Overwrite guest fields. Dates and room stay as booked.
    pub async fn update_guest(
        &self,
        admin: &Authenticated,
        id: ReservationId,
        guest: GuestDetails,
    ) -> Result<(), BookingError> {
        self.repo.update_reservation(id, guest).await?;
        tracing::info!(user_id = admin.user_id(), reservation_id = id, "guest details updated");
        Ok(())
    }

    /// Delete the reservation together with its restriction.
    pub async fn delete(
        &self,
        admin: &Authenticated,
        id: ReservationId,
    ) -> Result<(), BookingError> {
        self.repo.delete_reservation(id).await?;
        tracing::info!(user_id = admin.user_id(), reservation_id = id, "reservation deleted");
        Ok(())
    }

    pub async fn set_processed(
        &self,
        admin: &Authenticated,
        id: ReservationId,
        processed: bool,
    ) -> Result<(), BookingError> {
        self.repo.set_processed(id, processed).await?;
        tracing::info!(
            user_id = admin.user_id(),
            reservation_id = id,
            processed,
            "processed flag set"
        );
        Ok(())
    }

    pub async fn list_all(&self, admin: &Authenticated) -> Result<Vec<Reservation>, BookingError> {
        tracing::debug!(user_id = admin.user_id(), "admin lists reservations");
        Ok(self.repo.all_reservations().await?)
    }

    pub async fn list_unprocessed(
        &self,
        admin: &Authenticated,
    ) -> Result<Vec<Reservation>, BookingError> {
        tracing::debug!(user_id = admin.user_id(), "admin lists new reservations");
        Ok(self.repo.new_reservations().await?)
    }
}
