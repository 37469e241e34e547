use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ulid::Ulid;

use crate::booking::ReservationDraft;
use crate::calendar::BlockSnapshot;
use crate::model::{RoomId, UserId};
use crate::observability::SESSIONS_ACTIVE;

pub type SessionId = Ulid;

/// One-shot message slots shown on the next rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashKind {
    Flash,
    Error,
    Warning,
}

#[derive(Debug)]
pub enum SessionError {
    /// Unknown or expired session id.
    NotFound(SessionId),
    /// Live session with no logged-in user.
    Unauthenticated(SessionId),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotFound(id) => write!(f, "session not found: {id}"),
            SessionError::Unauthenticated(id) => write!(f, "session {id} is not logged in"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Proof that a session had a logged-in user when it was checked. Only
/// `SessionStore::require_user` hands these out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authenticated {
    session: SessionId,
    user_id: UserId,
}

impl Authenticated {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

#[derive(Debug, Clone)]
struct SessionData {
    draft: Option<ReservationDraft>,
    snapshots: HashMap<RoomId, BlockSnapshot>,
    flash: HashMap<FlashKind, String>,
    user_id: Option<UserId>,
    touched: Instant,
}

impl SessionData {
    fn new(now: Instant) -> Self {
        Self {
            draft: None,
            snapshots: HashMap::new(),
            flash: HashMap::new(),
            user_id: None,
            touched: now,
        }
    }
}

/// In-process session store. A session expires `lifetime` after its last
/// write; expired sessions read as absent and are dropped by `sweep_expired`.
pub struct SessionStore {
    sessions: DashMap<SessionId, SessionData>,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            lifetime,
        }
    }

    pub fn create(&self) -> SessionId {
        let id = Ulid::new();
        self.sessions.insert(id, SessionData::new(Instant::now()));
        self.report_size();
        id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn is_live(&self, data: &SessionData, now: Instant) -> bool {
        now.duration_since(data.touched) < self.lifetime
    }

    fn write<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut SessionData) -> T,
    ) -> Result<T, SessionError> {
        let now = Instant::now();
        let mut entry = self
            .sessions
            .get_mut(&id)
            .filter(|e| self.is_live(e.value(), now))
            .ok_or(SessionError::NotFound(id))?;
        entry.touched = now;
        Ok(f(entry.value_mut()))
    }

    fn read<T>(&self, id: SessionId, f: impl FnOnce(&SessionData) -> T) -> Option<T> {
        let entry = self.sessions.get(&id)?;
        self.is_live(entry.value(), Instant::now()).then(|| f(entry.value()))
    }

    pub fn put_draft(&self, id: SessionId, draft: ReservationDraft) -> Result<(), SessionError> {
        self.write(id, |s| s.draft = Some(draft))
    }

    pub fn draft(&self, id: SessionId) -> Option<ReservationDraft> {
        self.read(id, |s| s.draft.clone()).flatten()
    }

    pub fn take_draft(&self, id: SessionId) -> Option<ReservationDraft> {
        self.write(id, |s| s.draft.take()).ok().flatten()
    }

    /// Store the snapshot for its room, replacing any earlier one.
    pub fn put_snapshot(
        &self,
        id: SessionId,
        snapshot: BlockSnapshot,
    ) -> Result<(), SessionError> {
        self.write(id, |s| {
            s.snapshots.insert(snapshot.room_id, snapshot);
        })
    }

    pub fn snapshot(&self, id: SessionId, room_id: RoomId) -> Option<BlockSnapshot> {
        self.read(id, |s| s.snapshots.get(&room_id).cloned()).flatten()
    }

    pub fn put_flash(
        &self,
        id: SessionId,
        kind: FlashKind,
        message: impl Into<String>,
    ) -> Result<(), SessionError> {
        let message = message.into();
        self.write(id, |s| {
            s.flash.insert(kind, message);
        })
    }

    pub fn take_flash(&self, id: SessionId, kind: FlashKind) -> Option<String> {
        self.write(id, |s| s.flash.remove(&kind)).ok().flatten()
    }

    /// Record the logged-in user. Callers renew the session first.
    pub(crate) fn put_user(&self, id: SessionId, user_id: UserId) -> Result<(), SessionError> {
        self.write(id, |s| s.user_id = Some(user_id))
    }

    pub fn user(&self, id: SessionId) -> Option<UserId> {
        self.read(id, |s| s.user_id).flatten()
    }

    /// Gate for admin operations. A live session without a user gets the
    /// "Login First!" error flash.
    pub fn require_user(&self, id: SessionId) -> Result<Authenticated, SessionError> {
        let user_id = self.write(id, |s| {
            if s.user_id.is_none() {
                s.flash.insert(FlashKind::Error, "Login First!".to_string());
            }
            s.user_id
        })?;
        match user_id {
            Some(user_id) => Ok(Authenticated {
                session: id,
                user_id,
            }),
            None => {
                tracing::debug!(session = %id, "admin access without login");
                Err(SessionError::Unauthenticated(id))
            }
        }
    }

    pub fn destroy(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            self.report_size();
        }
    }

    /// Move the session's data under a fresh id (login/logout).
    pub fn renew(&self, id: SessionId) -> Result<SessionId, SessionError> {
        let (_, mut data) = self
            .sessions
            .remove(&id)
            .filter(|(_, data)| self.is_live(data, Instant::now()))
            .ok_or(SessionError::NotFound(id))?;
        let new_id = Ulid::new();
        data.touched = Instant::now();
        self.sessions.insert(new_id, data);
        tracing::debug!(old = %id, new = %new_id, "session renewed");
        Ok(new_id)
    }

    /// Drop sessions idle for at least `lifetime` as of `now`. Returns the
    /// number removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, data| now.saturating_duration_since(data.touched) < self.lifetime);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, "expired sessions swept");
        }
        self.report_size();
        removed
    }

    fn report_size(&self) {
        metrics::gauge!(SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}
