//! [`ProfileStore`](crate::profile::ProfileStore) backends.
//!
//! `rest` talks to the PostgREST endpoint with the project's anon key;
//! `postgres` goes straight to the database when a URL is configured.

pub mod postgres;
pub mod rest;

pub use postgres::PgProfileStore;
pub use rest::RestProfileStore;
