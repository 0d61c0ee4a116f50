//! Phone OTP sign-in for leads.
//!
//! SYSTEM CONTEXT
//! ==============
//! This path authenticates outside the backend session entirely. A verified
//! code yields a lead identifier, which is cached in local storage and
//! announced on the lead-login channel. The reconciler owns the receiving end
//! and is the only place lead and session identities meet.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::{AuthConfig, HttpTimeouts};
use crate::storage::{LEAD_USER_ID_KEY, LocalStore, StorageError};

const MIN_CODE_LEN: usize = 4;
const MAX_CODE_LEN: usize = 8;
const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;
const NATIONAL_DIGITS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("invalid code")]
    InvalidCode,
    #[error("otp request failed: {0}")]
    Request(String),
    #[error("otp response error: status {status}")]
    Response { status: u16, body: String },
    #[error("otp response parse failed: {0}")]
    Parse(String),
    #[error("failed to cache lead id: {0}")]
    Storage(#[from] StorageError),
}

impl OtpError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPhone => "E_INVALID_PHONE",
            Self::InvalidCode => "E_INVALID_CODE",
            Self::Request(_) => "E_OTP_REQUEST",
            Self::Response { .. } => "E_OTP_RESPONSE",
            Self::Parse(_) => "E_OTP_PARSE",
            Self::Storage(_) => "E_OTP_STORAGE",
        }
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Response { status: 429 | 500..=599, .. })
    }
}

/// Result of checking a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpVerification {
    pub success: bool,
    pub lead_id: Option<String>,
}

/// Backend that sends and checks one-time codes.
#[async_trait::async_trait]
pub trait OtpGateway: Send + Sync {
    async fn request_otp(&self, phone: &str) -> Result<(), OtpError>;
    async fn verify_otp(&self, phone: &str, code: &str) -> Result<OtpVerification, OtpError>;
}

// =============================================================================
// LEAD-LOGIN CHANNEL
// =============================================================================

/// A lead identifier that just completed OTP verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadLogin {
    pub user_id: String,
}

pub type LeadLoginReceiver = mpsc::UnboundedReceiver<LeadLogin>;

#[derive(Debug, Clone)]
pub struct LeadLoginSender {
    tx: mpsc::UnboundedSender<LeadLogin>,
}

impl LeadLoginSender {
    /// Announce a lead login. Returns `false` if the reconciler is gone.
    pub fn send(&self, user_id: impl Into<String>) -> bool {
        self.tx.send(LeadLogin { user_id: user_id.into() }).is_ok()
    }
}

/// Channel carrying lead logins from the OTP flow to the reconciler.
#[must_use]
pub fn lead_login_channel() -> (LeadLoginSender, LeadLoginReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LeadLoginSender { tx }, rx)
}

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Canonical `+<digits>` form of `raw`.
///
/// Ten bare digits are national numbers and get `country_code`; a single
/// leading trunk `0` is dropped first.
#[must_use]
pub fn normalize_phone(raw: &str, country_code: &str) -> Option<String> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let (international, digits) = if let Some(rest) = compact.strip_prefix('+') {
        (true, rest.to_owned())
    } else if let Some(rest) = compact.strip_prefix("00") {
        (true, rest.to_owned())
    } else {
        (false, compact.clone())
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    if international {
        return (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS)
            .contains(&digits.len())
            .then(|| format!("+{digits}"));
    }

    let national = match digits.strip_prefix('0') {
        Some(rest) if rest.len() == NATIONAL_DIGITS => rest,
        _ => digits.as_str(),
    };
    if national.len() == NATIONAL_DIGITS {
        return Some(format!("{country_code}{national}"));
    }
    (NATIONAL_DIGITS + 1..=MAX_PHONE_DIGITS)
        .contains(&digits.len())
        .then(|| format!("+{digits}"))
}

#[must_use]
pub fn normalize_code(code: &str) -> Option<String> {
    let normalized = code.trim();
    if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&normalized.len()) || !normalized.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(normalized.to_owned())
}

// =============================================================================
// FLOW
// =============================================================================

/// OTP sign-in: normalize input, talk to the gateway, cache and announce.
pub struct OtpFlow {
    gateway: Arc<dyn OtpGateway>,
    storage: Arc<dyn LocalStore>,
    leads: LeadLoginSender,
    country_code: String,
}

impl OtpFlow {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn OtpGateway>,
        storage: Arc<dyn LocalStore>,
        leads: LeadLoginSender,
        country_code: impl Into<String>,
    ) -> Self {
        Self { gateway, storage, leads, country_code: country_code.into() }
    }

    /// Send a code to `phone`. Returns the normalized number the code went to.
    ///
    /// # Errors
    ///
    /// Returns [`OtpError::InvalidPhone`] or the gateway's error.
    pub async fn request_otp(&self, phone: &str) -> Result<String, OtpError> {
        let phone = normalize_phone(phone, &self.country_code).ok_or(OtpError::InvalidPhone)?;
        self.gateway.request_otp(&phone).await?;
        tracing::info!(%phone, "otp requested");
        Ok(phone)
    }

    /// Check `code` for `phone`. On success the lead id is cached under
    /// `lead_user_id` and announced to the reconciler.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed input, a gateway failure, a success
    /// response without a lead id, or a storage write failure.
    pub async fn verify_otp(&self, phone: &str, code: &str) -> Result<OtpVerification, OtpError> {
        let phone = normalize_phone(phone, &self.country_code).ok_or(OtpError::InvalidPhone)?;
        let code = normalize_code(code).ok_or(OtpError::InvalidCode)?;

        let verification = self.gateway.verify_otp(&phone, &code).await?;
        if !verification.success {
            tracing::info!(%phone, "otp rejected");
            return Ok(OtpVerification { success: false, lead_id: None });
        }
        let lead_id = verification
            .lead_id
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OtpError::Parse("verification succeeded without a lead id".into()))?;

        self.storage.set(LEAD_USER_ID_KEY, &lead_id)?;
        if !self.leads.send(lead_id.clone()) {
            tracing::warn!(lead_id = %lead_id, "lead login not delivered; reconciler stopped");
        }
        Ok(OtpVerification { success: true, lead_id: Some(lead_id) })
    }
}

// =============================================================================
// LEGACY REST GATEWAY
// =============================================================================

/// OTP endpoints on the legacy REST backend.
pub struct LegacyOtpClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, alias = "leadId", alias = "id")]
    user_id: Option<String>,
}

impl LegacyOtpClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeouts: HttpTimeouts) -> Result<Self, OtpError> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.request())
            .connect_timeout(timeouts.connect())
            .build()
            .map_err(|e| OtpError::Request(e.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned() })
    }

    /// `None` when no legacy backend is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &AuthConfig) -> Result<Option<Self>, OtpError> {
        config
            .legacy_api_url
            .as_deref()
            .map(|url| Self::new(url, config.timeouts))
            .transpose()
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(u16, String), OtpError> {
        let response = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| OtpError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| OtpError::Request(e.to_string()))?;
        Ok((status, text))
    }
}

#[async_trait::async_trait]
impl OtpGateway for LegacyOtpClient {
    async fn request_otp(&self, phone: &str) -> Result<(), OtpError> {
        let (status, body) = self
            .post("otp/send", serde_json::json!({ "phone": phone }))
            .await?;
        if !(200..300).contains(&status) {
            return Err(OtpError::Response { status, body });
        }
        Ok(())
    }

    async fn verify_otp(&self, phone: &str, code: &str) -> Result<OtpVerification, OtpError> {
        let (status, body) = self
            .post("otp/verify", serde_json::json!({ "phone": phone, "otp": code }))
            .await?;
        parse_verify_response(status, &body)
    }
}

/// 400/401 mean a wrong or expired code; other non-2xx statuses are errors.
pub(crate) fn parse_verify_response(status: u16, body: &str) -> Result<OtpVerification, OtpError> {
    if matches!(status, 400 | 401) {
        return Ok(OtpVerification { success: false, lead_id: None });
    }
    if !(200..300).contains(&status) {
        return Err(OtpError::Response { status, body: body.to_owned() });
    }
    let parsed: VerifyResponse =
        serde_json::from_str(body).map_err(|e| OtpError::Parse(format!("{e}: {body}")))?;
    Ok(OtpVerification { success: parsed.success, lead_id: parsed.user_id })
}

#[cfg(test)]
#[path = "otp_test.rs"]
mod tests;
