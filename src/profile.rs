//! Profile records and the resolver that maps an identity to `{user, role}`.
//!
//! ARCHITECTURE
//! ============
//! Profiles live in a table keyed by subject identifier, but OTP-created rows
//! may only be findable by phone, so lookups match either column. A missing
//! profile is not an error: the resolver creates a minimal one with role
//! `user` on first sight.
//!
//! ERROR HANDLING
//! ==============
//! Resolution never fails. Lookup and creation errors are logged and degrade
//! to role `user` with a non-null user object. Nothing on these paths can
//! produce `admin`; only a stored role of exactly `"admin"` does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::identity::{AuthSource, AuthUser, Role};
use crate::session::SessionUser;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile request failed: {0}")]
    Request(String),
    #[error("profile response error: status {status}")]
    Response { status: u16, body: String },
    #[error("profile response parse failed: {0}")]
    Parse(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("profile not found: {id}")]
    NotFound { id: String },
    #[error("invalid profile update: {0}")]
    Invalid(String),
}

impl ProfileError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "E_PROFILE_REQUEST",
            Self::Response { .. } => "E_PROFILE_RESPONSE",
            Self::Parse(_) => "E_PROFILE_PARSE",
            Self::Db(_) => "E_PROFILE_DB",
            Self::NotFound { .. } => "E_PROFILE_NOT_FOUND",
            Self::Invalid(_) => "E_PROFILE_INVALID",
        }
    }
}

/// A stored profile row. `role` is kept raw; read it through [`Profile::role`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Profile {
    #[must_use]
    pub fn role(&self) -> Role {
        Role::from_stored(self.role.as_deref())
    }
}

/// Row written when a profile is created lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewProfile {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub role: Role,
}

/// Fields the profile-edit UI may change. Role is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfileUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.email.is_none() && self.phone.is_none() && self.avatar_url.is_none()
    }
}

/// Profile table access.
///
/// `access_token` is the signed-in user's bearer token when the call is made
/// on behalf of a backend session, so row-level policies see that user.
/// `None` means an anonymous call (lead logins).
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// Find the profile whose id or phone equals `identifier`.
    async fn find(&self, identifier: &str, access_token: Option<&str>) -> Result<Option<Profile>, ProfileError>;

    /// Insert `profile` unless a row with its id exists; return the stored row.
    async fn insert_if_absent(&self, profile: &NewProfile, access_token: Option<&str>) -> Result<Profile, ProfileError>;

    /// Apply `update` to the row with primary id `id`.
    async fn update(
        &self,
        id: &str,
        update: &ProfileUpdate,
        access_token: Option<&str>,
    ) -> Result<Profile, ProfileError>;
}

/// Name for a new profile: metadata name, else email local part, else phone.
#[must_use]
pub fn derive_display_name(metadata_name: Option<&str>, email: Option<&str>, phone: Option<&str>) -> String {
    if let Some(name) = metadata_name.map(str::trim).filter(|v| !v.is_empty()) {
        return name.to_owned();
    }
    if let Some(local) = email
        .and_then(|e| e.split('@').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return local.to_owned();
    }
    phone
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("user")
        .to_owned()
}

/// Outcome of resolving one identity source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub user: Option<AuthUser>,
    pub role: Role,
}

impl Resolution {
    #[must_use]
    pub fn guest() -> Self {
        Self { user: None, role: Role::Guest }
    }
}

/// Contact details the identity source already knows, used to fill gaps.
#[derive(Default)]
struct Hints<'a> {
    email: Option<&'a str>,
    phone: Option<&'a str>,
    name: Option<&'a str>,
    avatar_url: Option<&'a str>,
}

impl<'a> Hints<'a> {
    fn from_session(user: &'a SessionUser) -> Self {
        Self {
            email: user.email.as_deref().filter(|v| !v.is_empty()),
            phone: user.phone.as_deref().filter(|v| !v.is_empty()),
            name: user.user_metadata.preferred_name(),
            avatar_url: user.user_metadata.avatar_url.as_deref(),
        }
    }

    fn fallback_user(&self, uid: &str) -> AuthUser {
        AuthUser {
            uid: uid.to_owned(),
            email: self.email.map(str::to_owned),
            display_name: Some(derive_display_name(self.name, self.email, self.phone)),
            photo_url: self.avatar_url.map(str::to_owned),
            phone: self.phone.map(str::to_owned),
        }
    }

    fn merge(&self, uid: &str, profile: &Profile) -> AuthUser {
        AuthUser {
            uid: uid.to_owned(),
            email: profile.email.clone().or_else(|| self.email.map(str::to_owned)),
            display_name: profile
                .display_name
                .clone()
                .or_else(|| Some(derive_display_name(self.name, self.email, self.phone))),
            photo_url: profile.avatar_url.clone().or_else(|| self.avatar_url.map(str::to_owned)),
            phone: profile.phone.clone().or_else(|| self.phone.map(str::to_owned)),
        }
    }
}

/// Maps any [`AuthSource`] to a published user and role.
#[derive(Clone)]
pub struct ProfileResolver {
    store: Arc<dyn ProfileStore>,
}

impl ProfileResolver {
    #[must_use]
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Resolve `source`, creating the profile on first sight.
    pub async fn resolve(&self, source: &AuthSource) -> Resolution {
        let (subject, hints) = match source {
            AuthSource::SdkSession(session) => (session.subject(), Hints::from_session(&session.user)),
            AuthSource::LeadLogin(id) => (id.as_str(), Hints::default()),
            AuthSource::None => return Resolution::guest(),
        };

        let token = source.access_token();
        match self.store.find(subject, token).await {
            Ok(Some(profile)) => Resolution { user: Some(hints.merge(subject, &profile)), role: profile.role() },
            Ok(None) => self.create(subject, &hints, token).await,
            Err(e) => {
                tracing::warn!(subject, error = %e, "profile lookup failed; defaulting role to user");
                Resolution { user: Some(hints.fallback_user(subject)), role: Role::User }
            }
        }
    }

    async fn create(&self, subject: &str, hints: &Hints<'_>, token: Option<&str>) -> Resolution {
        let new_profile = NewProfile {
            id: subject.to_owned(),
            display_name: derive_display_name(hints.name, hints.email, hints.phone),
            email: hints.email.map(str::to_owned),
            phone: hints.phone.map(str::to_owned),
            avatar_url: hints.avatar_url.map(str::to_owned),
            role: Role::User,
        };

        match self.store.insert_if_absent(&new_profile, token).await {
            Ok(profile) => {
                tracing::info!(subject, "created profile");
                Resolution { user: Some(hints.merge(subject, &profile)), role: profile.role() }
            }
            Err(e) => {
                tracing::error!(subject, error = %e, "profile creation failed; defaulting role to user");
                Resolution { user: Some(hints.fallback_user(subject)), role: Role::User }
            }
        }
    }

    /// Apply a profile edit on behalf of the holder of `access_token`.
    /// Blank strings are rejected rather than stored.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::Invalid`] for an empty or blank update, or the
    /// store's error.
    pub async fn update_profile(
        &self,
        id: &str,
        update: ProfileUpdate,
        access_token: Option<&str>,
    ) -> Result<Profile, ProfileError> {
        let update = normalize_update(update)?;
        self.store.update(id, &update, access_token).await
    }
}

fn normalize_update(update: ProfileUpdate) -> Result<ProfileUpdate, ProfileError> {
    fn field(name: &str, value: Option<String>) -> Result<Option<String>, ProfileError> {
        match value.map(|v| v.trim().to_owned()) {
            Some(v) if v.is_empty() => Err(ProfileError::Invalid(format!("{name} must not be blank"))),
            other => Ok(other),
        }
    }

    if update.is_empty() {
        return Err(ProfileError::Invalid("no fields to update".into()));
    }
    let email = field("email", update.email)?.map(|e| e.to_ascii_lowercase());
    if email.as_deref().is_some_and(|e| !e.contains('@')) {
        return Err(ProfileError::Invalid("email must contain '@'".into()));
    }
    Ok(ProfileUpdate {
        display_name: field("display_name", update.display_name)?,
        email,
        phone: field("phone", update.phone)?,
        avatar_url: field("avatar_url", update.avatar_url)?,
    })
}

#[cfg(test)]
#[path = "profile_test.rs"]
mod tests;
