//! Supabase auth (GoTrue) REST client implementing [`SessionProvider`].
//!
//! DESIGN
//! ======
//! Mirrors what the browser SDK does for this app: the current session is kept
//! in memory, persisted to local storage under [`SESSION_STORAGE_KEY`], and
//! refreshed through the refresh-token grant when it is about to expire.
//! Every change is broadcast as an [`AuthChange`].
//!
//! TRADE-OFFS
//! ==========
//! Sign-out clears local state before calling the backend, so a failed remote
//! logout still leaves this client signed out.

use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};

use crate::config::{AuthConfig, HttpTimeouts};
use crate::session::{AuthChange, AuthEvent, Session, SessionError, SessionProvider, SessionUser};
use crate::storage::LocalStore;

/// Local storage key for the persisted session.
pub const SESSION_STORAGE_KEY: &str = "sb-auth-token";
const REFRESH_MARGIN_SECS: i64 = 60;
const EVENT_CHANNEL_CAPACITY: usize = 32;

pub struct SupabaseAuth {
    http: reqwest::Client,
    auth_url: String,
    anon_key: String,
    current: RwLock<Option<Session>>,
    events: broadcast::Sender<AuthChange>,
    storage: Arc<dyn LocalStore>,
}

impl SupabaseAuth {
    /// Build a client and restore any session persisted in `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        supabase_url: &str,
        anon_key: String,
        timeouts: HttpTimeouts,
        storage: Arc<dyn LocalStore>,
    ) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.request())
            .connect_timeout(timeouts.connect())
            .build()
            .map_err(|e| SessionError::Request(e.to_string()))?;
        let restored = restore_session(storage.as_ref());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            http,
            auth_url: auth_endpoint(supabase_url),
            anon_key,
            current: RwLock::new(restored),
            events,
            storage,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &AuthConfig, storage: Arc<dyn LocalStore>) -> Result<Self, SessionError> {
        Self::new(&config.supabase_url, config.supabase_anon_key.clone(), config.timeouts, storage)
    }

    /// Install `session` as current and announce the sign-in.
    pub async fn set_session(&self, session: Session) {
        self.replace(Some(session.clone())).await;
        self.emit(AuthEvent::SignedIn, Some(session));
    }

    /// Ask the backend to text a one-time code to `phone`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the backend rejects it.
    pub async fn sign_in_with_otp(&self, phone: &str) -> Result<(), SessionError> {
        let response = self
            .post("otp")
            .json(&serde_json::json!({ "phone": phone }))
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;
        let (status, body) = read_response(response).await?;
        check_status(status, &body)
    }

    /// Exchange a texted code for a backend session.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the code is rejected.
    pub async fn verify_otp(&self, phone: &str, token: &str) -> Result<Session, SessionError> {
        let response = self
            .post("verify")
            .json(&serde_json::json!({ "type": "sms", "phone": phone, "token": token }))
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;
        let (status, body) = read_response(response).await?;
        let session = parse_token_response(status, &body, now_unix())?;
        self.set_session(session.clone()).await;
        Ok(session)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/{path}", self.auth_url))
            .header("apikey", &self.anon_key)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, SessionError> {
        let response = self
            .post("token")
            .query(&[("grant_type", "refresh_token")])
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;
        let (status, body) = read_response(response).await?;
        parse_token_response(status, &body, now_unix())
    }

    async fn replace(&self, session: Option<Session>) {
        *self.current.write().await = session.clone();
        let persisted = match &session {
            Some(s) => serde_json::to_string(s)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    self.storage
                        .set(SESSION_STORAGE_KEY, &raw)
                        .map_err(|e| e.to_string())
                }),
            None => self
                .storage
                .remove(SESSION_STORAGE_KEY)
                .map_err(|e| e.to_string()),
        };
        if let Err(error) = persisted {
            tracing::warn!(%error, "failed to persist auth session");
        }
    }

    fn emit(&self, event: AuthEvent, session: Option<Session>) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.events.send(AuthChange::new(event, session));
    }
}

#[async_trait::async_trait]
impl SessionProvider for SupabaseAuth {
    async fn get_session(&self) -> Result<Option<Session>, SessionError> {
        let Some(session) = self.current.read().await.clone() else {
            return Ok(None);
        };
        if !session.expires_within(now_unix(), REFRESH_MARGIN_SECS) {
            return Ok(Some(session));
        }
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            return Ok(Some(session));
        };

        match self.refresh(refresh_token).await {
            Ok(fresh) => {
                self.replace(Some(fresh.clone())).await;
                self.emit(AuthEvent::TokenRefreshed, Some(fresh.clone()));
                Ok(Some(fresh))
            }
            Err(SessionError::Response { status: 400 | 401 | 403, body }) => {
                tracing::info!(subject = session.subject(), %body, "refresh token rejected; signing out locally");
                self.replace(None).await;
                self.emit(AuthEvent::SignedOut, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_user(&self) -> Result<Option<SessionUser>, SessionError> {
        let Some(session) = self.current.read().await.clone() else {
            return Ok(None);
        };
        let response = self
            .http
            .get(format!("{}/user", self.auth_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;
        let (status, body) = read_response(response).await?;
        parse_user(status, &body).map(Some)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn sign_out(&self) -> Result<(), SessionError> {
        let previous = self.current.write().await.take();
        self.replace(None).await;
        self.emit(AuthEvent::SignedOut, None);

        let Some(previous) = previous else {
            return Ok(());
        };
        let response = self
            .post("logout")
            .query(&[("scope", "local")])
            .bearer_auth(&previous.access_token)
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;
        let (status, body) = read_response(response).await?;
        check_status(status, &body)
    }
}

// =============================================================================
// WIRE TYPES + PURE HELPERS
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: SessionUser,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn auth_endpoint(supabase_url: &str) -> String {
    format!("{}/auth/v1", supabase_url.trim_end_matches('/'))
}

async fn read_response(response: reqwest::Response) -> Result<(u16, String), SessionError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| SessionError::Request(e.to_string()))?;
    Ok((status, body))
}

pub(crate) fn check_status(status: u16, body: &str) -> Result<(), SessionError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(SessionError::Response { status, body: body.to_owned() })
    }
}

pub(crate) fn parse_token_response(status: u16, body: &str, now: i64) -> Result<Session, SessionError> {
    check_status(status, body)?;
    let token: TokenResponse =
        serde_json::from_str(body).map_err(|e| SessionError::Parse(format!("{e}: {body}")))?;
    let expires_at = token
        .expires_at
        .or_else(|| token.expires_in.map(|secs| now + secs));
    Ok(Session {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at,
        user: token.user,
    })
}

pub(crate) fn parse_user(status: u16, body: &str) -> Result<SessionUser, SessionError> {
    check_status(status, body)?;
    serde_json::from_str(body).map_err(|e| SessionError::Parse(format!("{e}: {body}")))
}

fn restore_session(storage: &dyn LocalStore) -> Option<Session> {
    let raw = storage.get(SESSION_STORAGE_KEY)?;
    match serde_json::from_str::<Session>(&raw) {
        Ok(session) => Some(session),
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable persisted session");
            let _ = storage.remove(SESSION_STORAGE_KEY);
            None
        }
    }
}

#[cfg(test)]
#[path = "supabase_test.rs"]
mod tests;
