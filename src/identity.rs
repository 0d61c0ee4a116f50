//! Identity types shared by the resolver, reconciler and guards.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Coarse access level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Guest,
    User,
    Admin,
}

impl Role {
    /// Role for a stored profile value. Only the exact string `admin`
    /// elevates; anything else, including absence, is `User`.
    #[must_use]
    pub fn from_stored(raw: Option<&str>) -> Self {
        match raw {
            Some("admin") => Self::Admin,
            _ => Self::User,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user object handed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub phone: Option<String>,
}

/// Which identity source is authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthSource {
    /// A backend session asserting this user. Its access token authorizes
    /// the profile lookup.
    SdkSession(Session),
    /// An OTP-only lead login, keyed by the cached lead identifier.
    LeadLogin(String),
    #[default]
    None,
}

impl AuthSource {
    /// Subject identifier for this source, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::SdkSession(session) => Some(session.subject()),
            Self::LeadLogin(id) => Some(id),
            Self::None => None,
        }
    }

    /// Bearer token to present to the profile store. Lead logins have none.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::SdkSession(session) => Some(&session.access_token),
            Self::LeadLogin(_) | Self::None => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SdkSession(_) => "session",
            Self::LeadLogin(_) => "lead",
            Self::None => "none",
        }
    }
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
