use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::repo::BookingRepo;
use crate::store::StoreError;

/// Answers "is this room free" and "which rooms are free" for a date range.
///
/// Dates are assumed well-formed; `start >= end` is not rejected. A
/// zero-length range matches no restriction and so always reports free.
#[derive(Clone)]
pub struct AvailabilityEngine {
    repo: Arc<dyn BookingRepo>,
}

/// Payload of the per-room availability check, as returned to the booking
/// page's JSON endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub ok: bool,
    pub message: String,
    pub room_id: String,
    pub start_date: String,
    pub end_date: String,
}

impl AvailabilityReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl AvailabilityEngine {
    pub fn new(repo: Arc<dyn BookingRepo>) -> Self {
        Self { repo }
    }

    /// `Ok(true)` when no restriction on the room overlaps `[start, end)`.
    /// An `Err` means availability is unknown, never "booked".
    pub async fn is_room_free(
        &self,
        room_id: RoomId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<bool, StoreError> {
        let count = self
            .repo
            .restrictions_overlapping(room_id, DateSpan::new(start, end))
            .await?;
        Ok(count == 0)
    }

    /// Every room with no restriction overlapping `[start, end)`. An empty
    /// result means no availability.
    pub async fn search_all_rooms(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Room>, StoreError> {
        let rooms = self.repo.rooms_free_for(DateSpan::new(start, end)).await?;
        if rooms.is_empty() {
            tracing::info!(%start, %end, "no availability");
        }
        Ok(rooms)
    }

    pub async fn check_room(
        &self,
        room_id: RoomId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AvailabilityReport {
        let (ok, message) = match self.is_room_free(room_id, start, end).await {
            Ok(free) => (free, String::new()),
            Err(e) => {
                tracing::error!(room_id, %start, %end, "availability check failed: {e}");
                (false, "error querying database".to_string())
            }
        };
        AvailabilityReport {
            ok,
            message,
            room_id: room_id.to_string(),
            start_date: format_date(start),
            end_date: format_date(end),
        }
    }
}
