use std::time::Duration;

/// Deadline applied to every store call.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_ROOM_NAME_LEN: usize = 255;
pub const MAX_GUEST_FIELD_LEN: usize = 255;
pub const MAX_RESTRICTIONS_PER_ROOM: usize = 100_000;

/// Widest span a reservation or restriction may cover.
pub const MAX_SPAN_DAYS: i64 = 366 * 2;

pub const WAL_CHANNEL_CAPACITY: usize = 4096;
pub const DEFAULT_MAIL_QUEUE_CAPACITY: usize = 100;

pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
