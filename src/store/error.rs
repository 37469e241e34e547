use crate::model::{DateSpan, RestrictionId, RoomId};

#[derive(Debug)]
pub enum StoreError {
    NotFound { entity: &'static str, id: i64 },
    /// An exclusive insert found a row already covering part of the span.
    Overlap { room_id: RoomId, conflicting: RestrictionId },
    /// A unique key (user email) is already taken.
    Duplicate { entity: &'static str, key: String },
    InvalidSpan(DateSpan),
    /// Row shape violates the reservation/block tagging rule.
    InvalidRow(&'static str),
    LimitExceeded(&'static str),
    Timeout(&'static str),
    WalError(String),
}

impl StoreError {
    /// Short label for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::Overlap { .. } => "overlap",
            StoreError::Duplicate { .. } => "duplicate",
            StoreError::InvalidSpan(_) => "invalid_span",
            StoreError::InvalidRow(_) => "invalid_row",
            StoreError::LimitExceeded(_) => "limit_exceeded",
            StoreError::Timeout(_) => "timeout",
            StoreError::WalError(_) => "wal_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Timeouts and WAL failures may succeed on retry; the rest will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::WalError(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            StoreError::Overlap { room_id, conflicting } => write!(
                f,
                "room {room_id} already restricted by restriction {conflicting}"
            ),
            StoreError::Duplicate { entity, key } => write!(f, "{entity} already exists: {key}"),
            StoreError::InvalidSpan(span) => {
                write!(f, "invalid date span [{}, {})", span.start, span.end)
            }
            StoreError::InvalidRow(msg) => write!(f, "invalid row: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Timeout(op) => write!(f, "{op} exceeded query deadline"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
