//! Session accessor contract over the backend auth SDK.
//!
//! SYSTEM CONTEXT
//! ==============
//! The backend owns sessions entirely: it issues, refreshes and invalidates
//! them. Everything in this crate only reads the current session and listens
//! for change notifications through [`SessionProvider`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Errors surfaced by a session provider. No retries happen at this layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("auth request failed: {0}")]
    Request(String),
    #[error("auth response error: status {status}")]
    Response { status: u16, body: String },
    #[error("auth response parse failed: {0}")]
    Parse(String),
    #[error("no active session")]
    NoSession,
    #[error("session storage failed: {0}")]
    Storage(String),
}

impl SessionError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "E_AUTH_REQUEST",
            Self::Response { .. } => "E_AUTH_RESPONSE",
            Self::Parse(_) => "E_AUTH_PARSE",
            Self::NoSession => "E_NO_SESSION",
            Self::Storage(_) => "E_SESSION_STORAGE",
        }
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Response { status: 429 | 500..=599, .. })
    }
}

/// Free-form metadata the backend keeps alongside a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserMetadata {
    /// First non-blank name the metadata carries.
    #[must_use]
    pub fn preferred_name(&self) -> Option<&str> {
        [&self.full_name, &self.name, &self.display_name]
            .into_iter()
            .filter_map(Option::as_deref)
            .map(str::trim)
            .find(|v| !v.is_empty())
    }
}

/// The principal a session asserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Subject identifier.
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

impl SessionUser {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), email: None, phone: None, user_metadata: UserMetadata::default() }
    }
}

/// A backend session. Opaque apart from the subject it asserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) after which the access token is invalid.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: SessionUser,
}

impl Session {
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.user.id
    }

    /// True when the access token expires within `margin_secs` of `now`.
    #[must_use]
    pub fn expires_within(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp - margin_secs <= now)
    }
}

/// Auth lifecycle event kinds emitted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// One change notification: the event plus the session current after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

impl AuthChange {
    #[must_use]
    pub fn new(event: AuthEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }
}

/// Read access to backend sessions.
///
/// Subscriptions are broadcast receivers; dropping the receiver unsubscribes.
#[async_trait::async_trait]
pub trait SessionProvider: Send + Sync {
    /// Current session, or `None` when signed out.
    async fn get_session(&self) -> Result<Option<Session>, SessionError>;

    /// Fetch the user behind the current session from the backend.
    async fn get_user(&self) -> Result<Option<SessionUser>, SessionError>;

    /// Subscribe to login, logout and token-refresh notifications.
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;

    /// Invalidate the current session.
    async fn sign_out(&self) -> Result<(), SessionError>;
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
