//! Profile table over PostgREST (`/rest/v1/<table>`).
//!
//! Request building is thin; status handling and row parsing live in pure
//! functions so they can be tested without a server.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::{AuthConfig, HttpTimeouts};
use crate::profile::{NewProfile, Profile, ProfileError, ProfileStore, ProfileUpdate};

const SELECT_COLUMNS: &str = "id,display_name,email,phone,avatar_url,role,created_at,updated_at";

pub struct RestProfileStore {
    http: reqwest::Client,
    endpoint: String,
    anon_key: String,
}

impl RestProfileStore {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        supabase_url: &str,
        anon_key: String,
        table: &str,
        timeouts: HttpTimeouts,
    ) -> Result<Self, ProfileError> {
        let http = reqwest::Client::builder()
            .timeout(timeouts.request())
            .connect_timeout(timeouts.connect())
            .build()
            .map_err(|e| ProfileError::Request(e.to_string()))?;
        Ok(Self { http, endpoint: table_endpoint(supabase_url, table), anon_key })
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ProfileError> {
        Self::new(&config.supabase_url, config.supabase_anon_key.clone(), &config.profile_table, config.timeouts)
    }

    fn request(&self, method: reqwest::Method, access_token: Option<&str>) -> reqwest::RequestBuilder {
        self.http
            .request(method, &self.endpoint)
            .header("apikey", &self.anon_key)
            .header("Authorization", authorization(&self.anon_key, access_token))
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Vec<Profile>, ProfileError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ProfileError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProfileError::Request(e.to_string()))?;
        parse_rows(status, &body)
    }

    async fn find_by_id(&self, id: &str, access_token: Option<&str>) -> Result<Option<Profile>, ProfileError> {
        let rows = self
            .send(
                self.request(reqwest::Method::GET, access_token)
                    .query(&[("select", SELECT_COLUMNS), ("limit", "1")])
                    .query(&[("id", eq_filter(id))]),
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait::async_trait]
impl ProfileStore for RestProfileStore {
    async fn find(&self, identifier: &str, access_token: Option<&str>) -> Result<Option<Profile>, ProfileError> {
        let rows = self
            .send(
                self.request(reqwest::Method::GET, access_token)
                    .query(&[("select", SELECT_COLUMNS), ("limit", "2")])
                    .query(&[("or", id_or_phone_filter(identifier))]),
            )
            .await?;
        Ok(pick_match(rows, identifier))
    }

    async fn insert_if_absent(&self, profile: &NewProfile, access_token: Option<&str>) -> Result<Profile, ProfileError> {
        let rows = self
            .send(
                self.request(reqwest::Method::POST, access_token)
                    .query(&[("on_conflict", "id"), ("select", SELECT_COLUMNS)])
                    .header("Prefer", "resolution=ignore-duplicates,return=representation")
                    .json(profile),
            )
            .await?;
        if let Some(row) = rows.into_iter().next() {
            return Ok(row);
        }
        // Duplicate ignored: the row already exists.
        self.find_by_id(&profile.id, access_token)
            .await?
            .ok_or_else(|| ProfileError::NotFound { id: profile.id.clone() })
    }

    async fn update(
        &self,
        id: &str,
        update: &ProfileUpdate,
        access_token: Option<&str>,
    ) -> Result<Profile, ProfileError> {
        let body = update_body(update, OffsetDateTime::now_utc())?;
        let rows = self
            .send(
                self.request(reqwest::Method::PATCH, access_token)
                    .query(&[("id", eq_filter(id)), ("select", SELECT_COLUMNS.to_owned())])
                    .header("Prefer", "return=representation")
                    .json(&body),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ProfileError::NotFound { id: id.to_owned() })
    }
}

// =============================================================================
// PURE HELPERS
// =============================================================================

pub(crate) fn table_endpoint(supabase_url: &str, table: &str) -> String {
    format!("{}/rest/v1/{table}", supabase_url.trim_end_matches('/'))
}

/// `Authorization` value: the user's token when there is one, else the anon key.
pub(crate) fn authorization(anon_key: &str, access_token: Option<&str>) -> String {
    let bearer = access_token.filter(|t| !t.trim().is_empty()).unwrap_or(anon_key);
    format!("Bearer {bearer}")
}

/// Quote a value for a PostgREST filter so reserved characters stay literal.
pub(crate) fn quote_filter_value(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn eq_filter(value: &str) -> String {
    format!("eq.{}", quote_filter_value(value))
}

pub(crate) fn id_or_phone_filter(identifier: &str) -> String {
    let quoted = quote_filter_value(identifier);
    format!("(id.eq.{quoted},phone.eq.{quoted})")
}

/// Prefer the row whose primary id matches over a phone-only match.
pub(crate) fn pick_match(rows: Vec<Profile>, identifier: &str) -> Option<Profile> {
    let mut fallback = None;
    for row in rows {
        if row.id == identifier {
            return Some(row);
        }
        fallback.get_or_insert(row);
    }
    fallback
}

pub(crate) fn update_body(update: &ProfileUpdate, now: OffsetDateTime) -> Result<serde_json::Value, ProfileError> {
    let mut body = serde_json::to_value(update).map_err(|e| ProfileError::Parse(e.to_string()))?;
    let stamp = now
        .format(&Rfc3339)
        .map_err(|e| ProfileError::Parse(e.to_string()))?;
    if let Some(map) = body.as_object_mut() {
        map.insert("updated_at".into(), serde_json::Value::String(stamp));
    }
    Ok(body)
}

pub(crate) fn parse_rows(status: u16, body: &str) -> Result<Vec<Profile>, ProfileError> {
    if !(200..300).contains(&status) {
        return Err(ProfileError::Response { status, body: body.to_owned() });
    }
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).map_err(|e| ProfileError::Parse(format!("{e}: {body}")))
}

#[cfg(test)]
#[path = "rest_test.rs"]
mod tests;
