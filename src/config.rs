//! Auth configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PROFILE_TABLE: &str = "profiles";
pub const DEFAULT_STORAGE_PATH: &str = ".auth-storage.json";
pub const DEFAULT_COUNTRY_CODE: &str = "+91";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {var}")]
    Missing { var: String },
    #[error("config parse failed: {0}")]
    Parse(String),
}

impl ConfigError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "E_CONFIG_MISSING",
            Self::Parse(_) => "E_CONFIG_PARSE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl HttpTimeouts {
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Supabase project URL without trailing slash.
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub profile_table: String,
    /// Legacy REST backend serving the lead OTP endpoints. OTP sign-in is
    /// unavailable when unset.
    pub legacy_api_url: Option<String>,
    /// Direct Postgres URL. When set, profiles are read through sqlx instead
    /// of the PostgREST endpoint.
    pub database_url: Option<String>,
    /// Pool size for `database_url`.
    pub db_max_connections: u32,
    pub storage_path: PathBuf,
    pub default_country_code: String,
    pub timeouts: HttpTimeouts,
}

impl AuthConfig {
    /// Build typed auth config from environment variables.
    ///
    /// Required:
    /// - `SUPABASE_URL`
    /// - `SUPABASE_ANON_KEY`
    ///
    /// Optional:
    /// - `PROFILE_TABLE`: default `profiles`
    /// - `LEGACY_API_URL`: lead OTP backend
    /// - `DATABASE_URL`: direct Postgres profile store
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `AUTH_STORAGE_PATH`: default `.auth-storage.json`
    /// - `OTP_DEFAULT_COUNTRY_CODE`: default `+91`
    /// - `AUTH_REQUEST_TIMEOUT_SECS`: default 15
    /// - `AUTH_CONNECT_TIMEOUT_SECS`: default 5
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a URL is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let supabase_url = normalize_base_url("SUPABASE_URL", &required("SUPABASE_URL")?)?;
        let supabase_anon_key = required("SUPABASE_ANON_KEY")?;

        let profile_table = optional("PROFILE_TABLE").unwrap_or_else(|| DEFAULT_PROFILE_TABLE.to_owned());
        let legacy_api_url = optional("LEGACY_API_URL")
            .map(|raw| normalize_base_url("LEGACY_API_URL", &raw))
            .transpose()?;
        let database_url = optional("DATABASE_URL");
        let db_max_connections = u32::try_from(env_parse_u64("DB_MAX_CONNECTIONS", u64::from(DEFAULT_DB_MAX_CONNECTIONS)))
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
        let storage_path = optional("AUTH_STORAGE_PATH").map_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH), PathBuf::from);
        let default_country_code = parse_country_code(optional("OTP_DEFAULT_COUNTRY_CODE").as_deref())?;
        let timeouts = HttpTimeouts {
            request_secs: env_parse_u64("AUTH_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: env_parse_u64("AUTH_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };

        Ok(Self {
            supabase_url,
            supabase_anon_key,
            profile_table,
            legacy_api_url,
            database_url,
            db_max_connections,
            storage_path,
            default_country_code,
            timeouts,
        })
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    optional(key).ok_or_else(|| ConfigError::Missing { var: key.to_owned() })
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn normalize_base_url(key: &str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::Parse(format!("{key} must be an http(s) URL, got '{raw}'")));
    }
    Ok(trimmed.to_owned())
}

fn parse_country_code(raw: Option<&str>) -> Result<String, ConfigError> {
    let code = raw.unwrap_or(DEFAULT_COUNTRY_CODE);
    let digits = code.strip_prefix('+').unwrap_or(code);
    if digits.is_empty() || digits.len() > 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigError::Parse(format!("invalid OTP_DEFAULT_COUNTRY_CODE: {code}")));
    }
    Ok(format!("+{digits}"))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
