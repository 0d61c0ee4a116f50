use super::*;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::otp::{LeadLoginSender, lead_login_channel};
use crate::profile::test_helpers::{MockProfileStore, profile};
use crate::profile::{NewProfile, Profile, ProfileError, ProfileStore, ProfileUpdate};
use crate::session::{AuthEvent, SessionError, SessionUser};
use crate::storage::{MemoryCookieJar, MemoryLocalStore};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(80);

// =============================================================================
// MockSessions
// =============================================================================

struct MockSessions {
    current: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthChange>,
    fail_get: AtomicBool,
    fail_sign_out: AtomicBool,
    sign_outs: AtomicUsize,
}

impl MockSessions {
    fn new(current: Option<Session>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            current: Mutex::new(current),
            events,
            fail_get: AtomicBool::new(false),
            fail_sign_out: AtomicBool::new(false),
            sign_outs: AtomicUsize::new(0),
        }
    }

    fn sign_in(&self, id: &str) {
        let s = session(id);
        *self.current.lock().unwrap() = Some(s.clone());
        let _ = self.events.send(AuthChange::new(AuthEvent::SignedIn, Some(s)));
    }

    fn token_refreshed(&self) {
        let s = self.current.lock().unwrap().clone();
        let _ = self.events.send(AuthChange::new(AuthEvent::TokenRefreshed, s));
    }

    fn rotate_token(&self, access_token: &str) {
        let mut current = self.current.lock().unwrap();
        let Some(s) = current.as_mut() else { return };
        s.access_token = access_token.to_owned();
        let _ = self.events.send(AuthChange::new(AuthEvent::TokenRefreshed, Some(s.clone())));
    }

    fn expire(&self) {
        *self.current.lock().unwrap() = None;
        let _ = self.events.send(AuthChange::new(AuthEvent::SignedOut, None));
    }
}

#[async_trait::async_trait]
impl SessionProvider for MockSessions {
    async fn get_session(&self) -> Result<Option<Session>, SessionError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(SessionError::Request("network down".into()));
        }
        Ok(self.current.lock().unwrap().clone())
    }

    async fn get_user(&self) -> Result<Option<SessionUser>, SessionError> {
        Ok(self.current.lock().unwrap().as_ref().map(|s| s.user.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }

    async fn sign_out(&self) -> Result<(), SessionError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        self.expire();
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(SessionError::Response { status: 500, body: "logout failed".into() });
        }
        Ok(())
    }
}

fn session(id: &str) -> Session {
    let mut user = SessionUser::new(id);
    user.email = Some(format!("{id}@example.com"));
    Session { access_token: format!("at-{id}"), refresh_token: None, expires_at: None, user }
}

// =============================================================================
// GatedStore: holds lookups for chosen identifiers until released
// =============================================================================

struct GatedStore {
    inner: MockProfileStore,
    gates: Mutex<HashMap<String, watch::Receiver<bool>>>,
}

impl GatedStore {
    fn new(inner: MockProfileStore) -> Self {
        Self { inner, gates: Mutex::new(HashMap::new()) }
    }

    fn gate(&self, identifier: &str) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.gates.lock().unwrap().insert(identifier.to_owned(), rx);
        tx
    }
}

#[async_trait::async_trait]
impl ProfileStore for GatedStore {
    async fn find(&self, identifier: &str, access_token: Option<&str>) -> Result<Option<Profile>, ProfileError> {
        let gate = self.gates.lock().unwrap().get(identifier).cloned();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        self.inner.find(identifier, access_token).await
    }

    async fn insert_if_absent(&self, profile: &NewProfile, access_token: Option<&str>) -> Result<Profile, ProfileError> {
        self.inner.insert_if_absent(profile, access_token).await
    }

    async fn update(
        &self,
        id: &str,
        update: &ProfileUpdate,
        access_token: Option<&str>,
    ) -> Result<Profile, ProfileError> {
        self.inner.update(id, update, access_token).await
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    sessions: Arc<MockSessions>,
    store: Arc<GatedStore>,
    storage: Arc<MemoryLocalStore>,
    cookies: Arc<MemoryCookieJar>,
    leads: LeadLoginSender,
    handle: AuthHandle,
}

fn harness_with(sessions: MockSessions, store: GatedStore, storage: MemoryLocalStore) -> Harness {
    let sessions = Arc::new(sessions);
    let store = Arc::new(store);
    let storage = Arc::new(storage);
    let cookies = Arc::new(MemoryCookieJar::new());
    cookies.insert_original(SESSION_COOKIE, "legacy-token");
    let (leads, lead_rx) = lead_login_channel();

    let handle = Reconciler::new(
        sessions.clone() as Arc<dyn SessionProvider>,
        ProfileResolver::new(store.clone() as Arc<dyn ProfileStore>),
        storage.clone() as Arc<dyn LocalStore>,
        cookies.clone() as Arc<dyn CookieStore>,
        lead_rx,
    )
    .spawn();

    Harness { sessions, store, storage, cookies, leads, handle }
}

fn harness(current: Option<Session>, rows: Vec<Profile>) -> Harness {
    harness_with(
        MockSessions::new(current),
        GatedStore::new(MockProfileStore::with_rows(rows)),
        MemoryLocalStore::new(),
    )
}

fn storage_with_lead(lead_id: &str) -> MemoryLocalStore {
    let storage = MemoryLocalStore::new();
    storage.set(LEAD_USER_ID_KEY, lead_id).unwrap();
    storage
}

/// Wait until the published state satisfies `pred`.
async fn wait_until(handle: &AuthHandle, pred: impl FnMut(&AuthState) -> bool) -> AuthState {
    let mut rx = handle.subscribe();
    let state = tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for auth state")
        .expect("reconciler stopped");
    state.clone()
}

async fn settled(handle: &AuthHandle) -> AuthState {
    tokio::time::timeout(WAIT, handle.settled())
        .await
        .expect("timed out waiting to settle")
        .unwrap()
}

async fn resolved_as(handle: &AuthHandle, uid: &str) -> AuthState {
    wait_until(handle, |s| !s.loading && s.user.as_ref().is_some_and(|u| u.uid == uid)).await
}

/// Poll `cond` until it holds.
async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn uid(state: &AuthState) -> Option<&str> {
    state.user.as_ref().map(|u| u.uid.as_str())
}

// =============================================================================
// AuthState
// =============================================================================

#[test]
fn initial_state_is_loading_guest() {
    let state = AuthState::default();
    assert!(state.loading);
    assert!(state.user.is_none());
    assert_eq!(state.role, Role::Guest);
    assert!(!state.is_authenticated());
}

#[test]
fn auth_state_serializes_is_authenticated() {
    let json = serde_json::to_value(AuthState {
        user: Some(AuthUser { uid: "u1".into(), ..AuthUser::default() }),
        role: Role::Admin,
        loading: false,
    })
    .unwrap();
    assert_eq!(json["isAuthenticated"], true);
    assert_eq!(json["role"], "admin");
    assert_eq!(json["loading"], false);
    assert_eq!(json["user"]["uid"], "u1");

    let guest = serde_json::to_value(AuthState::guest()).unwrap();
    assert_eq!(guest["isAuthenticated"], false);
    assert!(guest["user"].is_null());
}

#[test]
fn guest_state_is_settled() {
    let state = AuthState::guest();
    assert!(!state.loading);
    assert!(!state.is_admin());
}

// =============================================================================
// mount
// =============================================================================

#[tokio::test]
async fn no_session_no_lead_settles_as_guest() {
    let h = harness(None, vec![]);
    let state = settled(&h.handle).await;
    assert_eq!(state, AuthState::guest());
    assert_eq!(h.store.inner.finds(), 0);
}

#[tokio::test]
async fn existing_admin_session_resolves_admin() {
    let h = harness(Some(session("u1")), vec![profile("u1", Some("admin"))]);
    let state = settled(&h.handle).await;
    assert_eq!(uid(&state), Some("u1"));
    assert_eq!(state.role, Role::Admin);
    assert!(state.is_admin());
}

#[tokio::test]
async fn cached_lead_without_session_resolves_lead() {
    let h = harness_with(
        MockSessions::new(None),
        GatedStore::new(MockProfileStore::with_rows([profile("lead42", Some("user"))])),
        storage_with_lead("lead42"),
    );
    let state = settled(&h.handle).await;
    assert_eq!(uid(&state), Some("lead42"));
    assert_eq!(state.role, Role::User);
}

#[tokio::test]
async fn session_fetch_failure_settles_as_guest_even_with_lead() {
    let sessions = MockSessions::new(Some(session("u1")));
    sessions.fail_get.store(true, Ordering::SeqCst);
    let h = harness_with(sessions, GatedStore::new(MockProfileStore::default()), storage_with_lead("lead42"));

    let state = settled(&h.handle).await;
    assert_eq!(state, AuthState::guest());
    assert_eq!(h.store.inner.finds(), 0);
}

#[tokio::test]
async fn unknown_session_user_gets_profile_created() {
    let h = harness(Some(session("new1")), vec![]);
    let state = settled(&h.handle).await;
    assert_eq!(uid(&state), Some("new1"));
    assert_eq!(state.role, Role::User);
    assert_eq!(h.store.inner.inserts(), 1);
    let name = state.user.unwrap().display_name;
    assert_eq!(name.as_deref(), Some("new1"));
}

#[tokio::test]
async fn profile_creation_failure_still_yields_user() {
    let store = MockProfileStore::default();
    *store.fail_insert.lock().unwrap() = true;
    let h = harness_with(MockSessions::new(Some(session("u1"))), GatedStore::new(store), MemoryLocalStore::new());

    let state = settled(&h.handle).await;
    assert_eq!(uid(&state), Some("u1"));
    assert_eq!(state.role, Role::User);
}

#[tokio::test]
async fn lookup_failure_defaults_role_to_user() {
    let store = MockProfileStore::with_rows([profile("u1", Some("admin"))]);
    *store.fail_find.lock().unwrap() = true;
    let h = harness_with(MockSessions::new(Some(session("u1"))), GatedStore::new(store), MemoryLocalStore::new());

    let state = settled(&h.handle).await;
    assert_eq!(uid(&state), Some("u1"));
    assert_eq!(state.role, Role::User);
}

// =============================================================================
// events
// =============================================================================

#[tokio::test]
async fn repeated_events_for_same_subject_look_up_once() {
    let h = harness(None, vec![profile("u1", None)]);
    settled(&h.handle).await;

    h.sessions.sign_in("u1");
    h.sessions.token_refreshed();
    resolved_as(&h.handle, "u1").await;
    h.sessions.token_refreshed();
    tokio::time::sleep(QUIET).await;

    assert_eq!(h.store.inner.finds(), 1);
    assert!(!h.handle.current().loading);
}

#[tokio::test]
async fn sign_in_after_guest_resolves_user() {
    let h = harness(None, vec![profile("u2", Some("user"))]);
    settled(&h.handle).await;

    h.sessions.sign_in("u2");
    let state = resolved_as(&h.handle, "u2").await;
    assert_eq!(state.role, Role::User);
}

#[tokio::test]
async fn null_session_event_falls_back_to_cached_lead() {
    let h = harness_with(
        MockSessions::new(Some(session("u1"))),
        GatedStore::new(MockProfileStore::with_rows([profile("u1", Some("admin")), profile("lead42", None)])),
        MemoryLocalStore::new(),
    );
    resolved_as(&h.handle, "u1").await;

    h.storage.set(LEAD_USER_ID_KEY, "lead42").unwrap();
    h.sessions.expire();

    let state = resolved_as(&h.handle, "lead42").await;
    assert_eq!(state.role, Role::User);
}

#[tokio::test]
async fn null_session_event_without_lead_goes_guest() {
    let h = harness(Some(session("u1")), vec![profile("u1", None)]);
    resolved_as(&h.handle, "u1").await;

    h.sessions.expire();
    let state = wait_until(&h.handle, |s| !s.loading && s.user.is_none()).await;
    assert_eq!(state, AuthState::guest());
}

#[tokio::test]
async fn same_subject_after_sign_out_is_looked_up_again() {
    let h = harness(Some(session("u1")), vec![profile("u1", None)]);
    resolved_as(&h.handle, "u1").await;

    h.sessions.expire();
    wait_until(&h.handle, |s| !s.loading && s.user.is_none()).await;
    h.sessions.sign_in("u1");
    resolved_as(&h.handle, "u1").await;

    assert_eq!(h.store.inner.finds(), 2);
}

#[tokio::test]
async fn lead_login_message_resolves_lead() {
    let h = harness(None, vec![profile("lead7", Some("admin"))]);
    settled(&h.handle).await;

    assert!(h.leads.send("lead7"));
    let state = resolved_as(&h.handle, "lead7").await;
    assert_eq!(state.role, Role::Admin);
}

#[tokio::test]
async fn session_sign_in_supersedes_lead() {
    let h = harness_with(
        MockSessions::new(None),
        GatedStore::new(MockProfileStore::with_rows([profile("lead42", None), profile("u1", Some("admin"))])),
        storage_with_lead("lead42"),
    );
    resolved_as(&h.handle, "lead42").await;

    h.sessions.sign_in("u1");
    let state = resolved_as(&h.handle, "u1").await;
    assert_eq!(state.role, Role::Admin);
}

// =============================================================================
// staleness
// =============================================================================

#[tokio::test]
async fn slow_lookup_for_old_subject_never_overwrites_newer_one() {
    let h = harness(None, vec![profile("a", Some("admin")), profile("b", Some("user"))]);
    let release_a = h.store.gate("a");
    settled(&h.handle).await;

    h.sessions.sign_in("a");
    wait_until(&h.handle, |s| s.loading).await;
    h.sessions.sign_in("b");
    let state = resolved_as(&h.handle, "b").await;
    assert_eq!(state.role, Role::User);

    release_a.send(true).unwrap();
    tokio::time::sleep(QUIET).await;

    let state = h.handle.current();
    assert_eq!(uid(&state), Some("b"));
    assert_eq!(state.role, Role::User);
}

#[tokio::test]
async fn refresh_event_during_other_lookup_supersedes_it() {
    let h = harness(Some(session("u1")), vec![profile("u1", Some("admin")), profile("lead42", None)]);
    resolved_as(&h.handle, "u1").await;
    let release_lead = h.store.gate("lead42");
    let release_u1 = h.store.gate("u1");

    assert!(h.leads.send("lead42"));
    wait_until(&h.handle, |s| s.loading).await;
    h.sessions.token_refreshed();
    tokio::time::sleep(QUIET).await;

    // The u1 event must not settle on the old result while lookups run.
    let mid = h.handle.current();
    assert!(mid.loading);
    assert_eq!(evaluate_admin(&mid), crate::guard::Access::Pending);

    release_u1.send(true).unwrap();
    let state = resolved_as(&h.handle, "u1").await;
    assert_eq!(state.role, Role::Admin);

    release_lead.send(true).unwrap();
    tokio::time::sleep(QUIET).await;
    assert_eq!(uid(&h.handle.current()), Some("u1"));
}

fn evaluate_admin(state: &AuthState) -> crate::guard::Access {
    crate::guard::evaluate(state, crate::guard::Gate::Admin)
}

#[tokio::test]
async fn completion_from_old_generation_is_discarded() {
    let (_leads, lead_rx) = lead_login_channel();
    let mut reconciler = Reconciler::new(
        Arc::new(MockSessions::new(None)) as Arc<dyn SessionProvider>,
        ProfileResolver::new(Arc::new(MockProfileStore::default()) as Arc<dyn ProfileStore>),
        Arc::new(MemoryLocalStore::new()) as Arc<dyn LocalStore>,
        Arc::new(MemoryCookieJar::new()) as Arc<dyn CookieStore>,
        lead_rx,
    );
    reconciler.generation = 5;

    reconciler.on_completed(Completed {
        generation: 4,
        subject: "old".into(),
        resolution: Resolution { user: Some(AuthUser { uid: "old".into(), ..AuthUser::default() }), role: Role::Admin },
    });

    assert_eq!(*reconciler.state.borrow(), AuthState::initial());
    assert!(reconciler.last_resolved.is_none());
}

#[tokio::test]
async fn loading_is_published_while_lookup_is_pending() {
    let h = harness(None, vec![profile("a", None)]);
    let release_a = h.store.gate("a");
    settled(&h.handle).await;

    h.sessions.sign_in("a");
    let state = wait_until(&h.handle, |s| s.loading).await;
    assert!(state.user.is_none());

    release_a.send(true).unwrap();
    resolved_as(&h.handle, "a").await;
}

// =============================================================================
// commands
// =============================================================================

#[tokio::test]
async fn logout_clears_everything_and_opens_sign_in() {
    let h = harness_with(
        MockSessions::new(Some(session("u1"))),
        GatedStore::new(MockProfileStore::with_rows([profile("u1", Some("admin"))])),
        storage_with_lead("lead42"),
    );
    resolved_as(&h.handle, "u1").await;
    let mut ui = h.handle.ui_signals();

    h.handle.logout().await.unwrap();

    assert_eq!(h.handle.current(), AuthState::guest());
    assert!(h.storage.get(LEAD_USER_ID_KEY).is_none());
    assert!(h.cookies.value(SESSION_COOKIE).is_none());
    assert!(h.cookies.set_cookie_headers().iter().any(|c| c.starts_with("userToken=;") && c.contains("Max-Age=0")));
    assert_eq!(h.sessions.sign_outs.load(Ordering::SeqCst), 1);
    assert_eq!(ui.try_recv().unwrap(), UiSignal::OpenSignIn);

    // The SignedOut event from the backend must not bring the lead back.
    tokio::time::sleep(QUIET).await;
    assert_eq!(h.handle.current(), AuthState::guest());
}

#[tokio::test]
async fn logout_is_local_even_when_backend_sign_out_fails() {
    let sessions = MockSessions::new(Some(session("u1")));
    sessions.fail_sign_out.store(true, Ordering::SeqCst);
    let h = harness_with(
        sessions,
        GatedStore::new(MockProfileStore::with_rows([profile("u1", None)])),
        MemoryLocalStore::new(),
    );
    resolved_as(&h.handle, "u1").await;

    h.handle.logout().await.unwrap();
    assert_eq!(h.handle.current(), AuthState::guest());
    assert!(h.cookies.value(SESSION_COOKIE).is_none());
}

#[tokio::test]
async fn logout_cancels_pending_lookup() {
    let h = harness(None, vec![profile("a", Some("admin"))]);
    let release_a = h.store.gate("a");
    settled(&h.handle).await;

    h.sessions.sign_in("a");
    wait_until(&h.handle, |s| s.loading).await;
    h.handle.logout().await.unwrap();
    release_a.send(true).unwrap();
    tokio::time::sleep(QUIET).await;

    assert_eq!(h.handle.current(), AuthState::guest());
}

#[tokio::test]
async fn refresh_looks_up_current_identity_again() {
    let h = harness(Some(session("u1")), vec![profile("u1", Some("user"))]);
    resolved_as(&h.handle, "u1").await;

    h.store
        .inner
        .rows
        .lock()
        .unwrap()
        .insert("u1".into(), profile("u1", Some("admin")));
    h.handle.refresh().await.unwrap();

    let state = wait_until(&h.handle, |s| !s.loading && s.role == Role::Admin).await;
    assert_eq!(uid(&state), Some("u1"));
    assert_eq!(h.store.inner.finds(), 2);
}

#[tokio::test]
async fn lookups_present_the_latest_session_token() {
    let h = harness(Some(session("u1")), vec![profile("u1", None)]);
    resolved_as(&h.handle, "u1").await;

    h.sessions.rotate_token("at-u1-rotated");
    tokio::time::sleep(QUIET).await;
    h.handle.refresh().await.unwrap();
    eventually(|| h.store.inner.finds() == 2).await;

    let tokens = h.store.inner.find_tokens.lock().unwrap().clone();
    assert_eq!(tokens, vec![Some("at-u1".to_owned()), Some("at-u1-rotated".to_owned())]);
}

#[tokio::test]
async fn lead_lookups_are_anonymous() {
    let h = harness(None, vec![profile("lead7", None)]);
    settled(&h.handle).await;

    assert!(h.leads.send("lead7"));
    resolved_as(&h.handle, "lead7").await;
    assert_eq!(*h.store.inner.find_tokens.lock().unwrap(), vec![None]);
}

#[tokio::test]
async fn refresh_as_guest_is_a_no_op() {
    let h = harness(None, vec![]);
    settled(&h.handle).await;

    h.handle.refresh().await.unwrap();
    tokio::time::sleep(QUIET).await;

    assert_eq!(h.handle.current(), AuthState::guest());
    assert_eq!(h.store.inner.finds(), 0);
}
