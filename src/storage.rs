//! Client-local persistence: key/value storage and the middleware cookie.
//!
//! SYSTEM CONTEXT
//! ==============
//! The lead OTP login keeps its identifier in local storage under
//! [`LEAD_USER_ID_KEY`], and an external middleware layer reads the
//! [`SESSION_COOKIE`] cookie. Logout clears both.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cookie::{Cookie, CookieJar};

/// Local storage key holding the OTP-derived lead identifier.
pub const LEAD_USER_ID_KEY: &str = "lead_user_id";
/// Cookie read by the route middleware.
pub const SESSION_COOKIE: &str = "userToken";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is not valid json: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StorageError {
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "E_STORAGE_IO",
            Self::Corrupt(_) => "E_STORAGE_CORRUPT",
        }
    }
}

/// String key/value storage scoped to this client.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Cached lead identifier, ignoring blank values.
#[must_use]
pub fn cached_lead_id(store: &dyn LocalStore) -> Option<String> {
    store
        .get(LEAD_USER_ID_KEY)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

// =============================================================================
// MEMORY STORE
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON-file backed store. Every write rewrites the whole file.
#[derive(Debug)]
pub struct FileLocalStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileLocalStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let body = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_owned());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

// =============================================================================
// COOKIES
// =============================================================================

/// Cookies shared with the middleware layer.
pub trait CookieStore: Send + Sync {
    /// Expire the named cookie.
    fn clear(&self, name: &str);
}

/// Removal cookie for `name`: empty value, root path, zero max-age.
#[must_use]
pub fn expired_cookie(name: &str) -> Cookie<'static> {
    Cookie::build((name.to_owned(), ""))
        .path("/")
        .max_age(cookie::time::Duration::ZERO)
        .build()
}

/// In-process cookie jar that records the `Set-Cookie` delta it would emit.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    jar: Mutex<CookieJar>,
}

impl MemoryCookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cookie the client already holds.
    pub fn insert_original(&self, name: &str, value: &str) {
        let mut jar = self.jar.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        jar.add_original(Cookie::build((name.to_owned(), value.to_owned())).path("/").build());
    }

    /// Current value of `name`; a cleared cookie reads as absent.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        let jar = self.jar.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        jar.get(name)
            .filter(|c| c.max_age() != Some(cookie::time::Duration::ZERO))
            .map(|c| c.value().to_owned())
    }

    /// `Set-Cookie` header values for every change since construction.
    #[must_use]
    pub fn set_cookie_headers(&self) -> Vec<String> {
        let jar = self.jar.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        jar.delta().map(ToString::to_string).collect()
    }
}

impl CookieStore for MemoryCookieJar {
    // Always emit the removal, whether or not the jar has seen the cookie.
    fn clear(&self, name: &str) {
        let mut jar = self.jar.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        jar.add(expired_cookie(name));
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod tests;
