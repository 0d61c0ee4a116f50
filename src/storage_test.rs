use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};

static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

fn scratch_path(label: &str) -> PathBuf {
    let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("marketplace-auth-{label}-{}-{seq}.json", std::process::id()))
}

// =============================================================================
// MemoryLocalStore
// =============================================================================

#[test]
fn memory_store_set_get_remove() {
    let store = MemoryLocalStore::new();
    assert!(store.get(LEAD_USER_ID_KEY).is_none());
    store.set(LEAD_USER_ID_KEY, "lead42").unwrap();
    assert_eq!(store.get(LEAD_USER_ID_KEY).as_deref(), Some("lead42"));
    store.remove(LEAD_USER_ID_KEY).unwrap();
    assert!(store.get(LEAD_USER_ID_KEY).is_none());
}

#[test]
fn cached_lead_id_ignores_blank() {
    let store = MemoryLocalStore::new();
    store.set(LEAD_USER_ID_KEY, "   ").unwrap();
    assert!(cached_lead_id(&store).is_none());
    store.set(LEAD_USER_ID_KEY, " lead42 ").unwrap();
    assert_eq!(cached_lead_id(&store).as_deref(), Some("lead42"));
}

// =============================================================================
// FileLocalStore
// =============================================================================

#[test]
fn file_store_missing_file_starts_empty() {
    let path = scratch_path("missing");
    let store = FileLocalStore::open(&path).unwrap();
    assert!(store.get("anything").is_none());
    assert!(!path.exists());
}

#[test]
fn file_store_persists_across_reopen() {
    let path = scratch_path("reopen");
    {
        let store = FileLocalStore::open(&path).unwrap();
        store.set(LEAD_USER_ID_KEY, "lead42").unwrap();
        store.set("theme", "dark").unwrap();
    }
    let reopened = FileLocalStore::open(&path).unwrap();
    assert_eq!(reopened.get(LEAD_USER_ID_KEY).as_deref(), Some("lead42"));
    assert_eq!(reopened.get("theme").as_deref(), Some("dark"));

    reopened.remove(LEAD_USER_ID_KEY).unwrap();
    let again = FileLocalStore::open(&path).unwrap();
    assert!(again.get(LEAD_USER_ID_KEY).is_none());
    assert_eq!(again.get("theme").as_deref(), Some("dark"));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn file_store_rejects_corrupt_file() {
    let path = scratch_path("corrupt");
    std::fs::write(&path, "{not json").unwrap();
    let err = FileLocalStore::open(&path).unwrap_err();
    assert_eq!(err.error_code(), "E_STORAGE_CORRUPT");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn file_store_remove_absent_key_is_noop() {
    let path = scratch_path("noop");
    let store = FileLocalStore::open(&path).unwrap();
    store.remove("nope").unwrap();
    assert!(!path.exists());
}

// =============================================================================
// Cookies
// =============================================================================

#[test]
fn expired_cookie_shape() {
    let c = expired_cookie(SESSION_COOKIE);
    assert_eq!(c.name(), "userToken");
    assert_eq!(c.value(), "");
    assert_eq!(c.path(), Some("/"));
    assert_eq!(c.max_age(), Some(cookie::time::Duration::ZERO));
}

#[test]
fn cookie_jar_clear_removes_and_emits_removal() {
    let jar = MemoryCookieJar::new();
    jar.insert_original(SESSION_COOKIE, "tok");
    assert_eq!(jar.value(SESSION_COOKIE).as_deref(), Some("tok"));

    jar.clear(SESSION_COOKIE);

    assert!(jar.value(SESSION_COOKIE).is_none());
    let headers = jar.set_cookie_headers();
    assert_eq!(headers.len(), 1);
    assert!(headers[0].starts_with("userToken="));
    assert!(headers[0].contains("Max-Age=0"));
}

#[test]
fn cookie_jar_clear_emits_removal_for_unseen_cookie() {
    let jar = MemoryCookieJar::new();

    jar.clear(SESSION_COOKIE);

    assert!(jar.value(SESSION_COOKIE).is_none());
    let headers = jar.set_cookie_headers();
    assert_eq!(headers.len(), 1);
    assert!(headers[0].starts_with("userToken=;"));
    assert!(headers[0].contains("Path=/"));
    assert!(headers[0].contains("Max-Age=0"));
}
