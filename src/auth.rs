use std::sync::Arc;

use crate::form::{LoginForm, ValidationError};
use crate::model::{User, UserId, UserProfile};
use crate::observability::LOGINS_TOTAL;
use crate::repo::BookingRepo;
use crate::session::{Authenticated, FlashKind, SessionError, SessionId, SessionStore};
use crate::store::StoreError;

const INVALID_CREDENTIALS: &str = "Invalid login credentials";

#[derive(Debug)]
pub enum AuthError {
    Validation(ValidationError),
    UnknownEmail,
    IncorrectPassword,
    Store(StoreError),
    /// bcrypt failed or its worker task died.
    Hash(String),
    Session(SessionError),
}

impl AuthError {
    /// Text safe to show an end user. Unknown email and wrong password read
    /// the same.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::Validation(_) => "Please correct the errors in the form",
            AuthError::UnknownEmail | AuthError::IncorrectPassword => INVALID_CREDENTIALS,
            AuthError::Session(_) => "Your session has expired, please log in again",
            AuthError::Store(_) | AuthError::Hash(_) => {
                "Something went wrong, please try again later"
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AuthError::Validation(_) => "invalid",
            AuthError::UnknownEmail | AuthError::IncorrectPassword => "rejected",
            AuthError::Session(_) => "no_session",
            AuthError::Store(_) | AuthError::Hash(_) => "failed",
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        AuthError::Store(e)
    }
}

impl From<ValidationError> for AuthError {
    fn from(e: ValidationError) -> Self {
        AuthError::Validation(e)
    }
}

impl From<SessionError> for AuthError {
    fn from(e: SessionError) -> Self {
        AuthError::Session(e)
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Validation(e) => write!(f, "invalid login form: {e}"),
            AuthError::UnknownEmail => write!(f, "no user with that email"),
            AuthError::IncorrectPassword => write!(f, "incorrect password"),
            AuthError::Store(e) => write!(f, "store error: {e}"),
            AuthError::Hash(e) => write!(f, "password hashing failed: {e}"),
            AuthError::Session(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Validation(e) => Some(e),
            AuthError::Store(e) => Some(e),
            AuthError::Session(e) => Some(e),
            _ => None,
        }
    }
}

/// Admin accounts and the login/logout flow over sessions.
#[derive(Clone)]
pub struct Authenticator {
    repo: Arc<dyn BookingRepo>,
    sessions: Arc<SessionStore>,
    cost: u32,
}

impl Authenticator {
    pub fn new(repo: Arc<dyn BookingRepo>, sessions: Arc<SessionStore>) -> Self {
        Self::with_cost(repo, sessions, bcrypt::DEFAULT_COST)
    }

    /// `cost` is the bcrypt work factor used for new hashes.
    pub fn with_cost(repo: Arc<dyn BookingRepo>, sessions: Arc<SessionStore>, cost: u32) -> Self {
        Self {
            repo,
            sessions,
            cost,
        }
    }

    /// Create an account with a bcrypt hash of `password`.
    pub async fn register(
        &self,
        profile: UserProfile,
        password: &str,
    ) -> Result<UserId, AuthError> {
        if password.is_empty() {
            let mut errors = ValidationError::default();
            errors.add("password", "This field cannot be blank");
            return Err(errors.into());
        }
        let password = password.to_string();
        let cost = self.cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))?
            .map_err(|e| AuthError::Hash(e.to_string()))?;
        let id = self.repo.insert_user(profile, hash).await?;
        Ok(id)
    }

    /// Id of the account whose email and password match.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let user = self
            .repo
            .user_by_email(email)
            .await?
            .ok_or(AuthError::UnknownEmail)?;
        let password = password.to_string();
        let hash = user.password_hash;
        let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))?
            .map_err(|e| AuthError::Hash(e.to_string()))?;
        if !matches {
            return Err(AuthError::IncorrectPassword);
        }
        Ok(user.id)
    }

    /// Check the posted credentials and log the session in. The session is
    /// renewed, so callers must continue with the returned token's id.
    pub async fn login(
        &self,
        session: SessionId,
        form: &LoginForm,
    ) -> Result<Authenticated, AuthError> {
        let result = self.login_inner(session, form).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(LOGINS_TOTAL, "status" => status).increment(1);
        result
    }

    async fn login_inner(
        &self,
        session: SessionId,
        form: &LoginForm,
    ) -> Result<Authenticated, AuthError> {
        form.validate()?;
        let user_id = match self.authenticate(&form.email, &form.password).await {
            Ok(id) => id,
            Err(e @ (AuthError::UnknownEmail | AuthError::IncorrectPassword)) => {
                tracing::info!(session = %session, "login rejected: {e}");
                let _ = self.sessions.put_flash(session, FlashKind::Flash, INVALID_CREDENTIALS);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let session = self.sessions.renew(session)?;
        self.sessions.put_user(session, user_id)?;
        self.sessions.put_flash(session, FlashKind::Flash, "Logged in successfully")?;
        tracing::info!(user_id, session = %session, "admin logged in");
        Ok(self.sessions.require_user(session)?)
    }

    /// Drop the session and hand back a fresh anonymous one.
    pub fn logout(&self, session: SessionId) -> SessionId {
        if let Some(user_id) = self.sessions.user(session) {
            tracing::info!(user_id, "admin logged out");
        }
        self.sessions.destroy(session);
        self.sessions.create()
    }

    pub async fn user(&self, admin: &Authenticated, id: UserId) -> Result<User, AuthError> {
        tracing::debug!(user_id = admin.user_id(), target_user = id, "admin reads user");
        Ok(self.repo.get_user(id).await?)
    }

    /// Overwrite an account's profile. The password is unchanged.
    pub async fn update_user(
        &self,
        admin: &Authenticated,
        id: UserId,
        profile: UserProfile,
    ) -> Result<(), AuthError> {
        self.repo.update_user(id, profile).await?;
        tracing::info!(user_id = admin.user_id(), target_user = id, "user profile updated");
        Ok(())
    }
}
