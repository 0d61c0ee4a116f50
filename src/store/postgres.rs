//! Profile table read directly through SQLx.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::profile::{NewProfile, Profile, ProfileError, ProfileStore, ProfileUpdate};

#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        let row = sqlx::query(
            r"SELECT id, display_name, email, phone, avatar_url, role, created_at, updated_at
              FROM profiles
              WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(profile_from_row))
    }
}

fn profile_from_row(r: &PgRow) -> Profile {
    Profile {
        id: r.get("id"),
        display_name: r.get("display_name"),
        email: r.get("email"),
        phone: r.get("phone"),
        avatar_url: r.get("avatar_url"),
        role: r.get("role"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

// Direct connections authenticate as the pool's role; bearer tokens only
// matter to PostgREST and are ignored here.
#[async_trait::async_trait]
impl ProfileStore for PgProfileStore {
    async fn find(&self, identifier: &str, _access_token: Option<&str>) -> Result<Option<Profile>, ProfileError> {
        let row = sqlx::query(
            r"SELECT id, display_name, email, phone, avatar_url, role, created_at, updated_at
              FROM profiles
              WHERE id = $1 OR phone = $1
              ORDER BY (id = $1) DESC, created_at ASC
              LIMIT 1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(profile_from_row))
    }

    async fn insert_if_absent(&self, profile: &NewProfile, _access_token: Option<&str>) -> Result<Profile, ProfileError> {
        let row = sqlx::query(
            r"INSERT INTO profiles (id, display_name, email, phone, avatar_url, role)
              VALUES ($1, $2, $3, $4, $5, $6)
              ON CONFLICT (id) DO NOTHING
              RETURNING id, display_name, email, phone, avatar_url, role, created_at, updated_at",
        )
        .bind(&profile.id)
        .bind(&profile.display_name)
        .bind(&profile.email)
        .bind(&profile.phone)
        .bind(&profile.avatar_url)
        .bind(profile.role.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(profile_from_row(&row)),
            None => self
                .find_by_id(&profile.id)
                .await?
                .ok_or_else(|| ProfileError::NotFound { id: profile.id.clone() }),
        }
    }

    async fn update(
        &self,
        id: &str,
        update: &ProfileUpdate,
        _access_token: Option<&str>,
    ) -> Result<Profile, ProfileError> {
        let row = sqlx::query(
            r"UPDATE profiles
              SET display_name = COALESCE($2, display_name),
                  email = COALESCE($3, email),
                  phone = COALESCE($4, phone),
                  avatar_url = COALESCE($5, avatar_url),
                  updated_at = now()
              WHERE id = $1
              RETURNING id, display_name, email, phone, avatar_url, role, created_at, updated_at",
        )
        .bind(id)
        .bind(&update.display_name)
        .bind(&update.email)
        .bind(&update.phone)
        .bind(&update.avatar_url)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(profile_from_row)
            .ok_or_else(|| ProfileError::NotFound { id: id.to_owned() })
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
