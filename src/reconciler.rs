//! Auth state reconciler: one task that turns session events, lead logins and
//! commands into a single published `{user, role, loading}` state.
//!
//! ARCHITECTURE
//! ============
//! The reconciler task is the only writer of the published [`AuthState`]; it
//! owns the `watch` sender and everything else holds receivers through
//! [`AuthHandle`]. Inputs arrive on three channels (backend auth changes, the
//! lead-login channel from the OTP flow, handle commands) plus a fourth
//! internal channel carrying profile resolutions back from child tasks.
//!
//! ```text
//! SessionProvider ──AuthChange──┐
//! OtpFlow ─────────LeadLogin────┼──► Reconciler ──watch──► guards / UI
//! AuthHandle ──────Command──────┘        │  ▲
//!                                 spawn  ▼  │ Completed{generation}
//!                                    ProfileResolver
//! ```
//!
//! STALENESS
//! =========
//! Every resolution is stamped with a generation. Starting a new resolution
//! (or settling to guest) bumps the generation and aborts the previous child
//! task; a completion whose generation is not current is dropped. A slow
//! lookup for an old identity therefore never overwrites a newer one.
//!
//! IDEMPOTENCE
//! ===========
//! A session event for the subject that is already resolved, or already being
//! resolved, does not start another lookup. Token refreshes only clear
//! `loading`. Starting any resolution forgets the last resolved subject, so
//! an event for it while a different lookup runs starts a fresh one instead.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::identity::{AuthSource, AuthUser, Role};
use crate::otp::LeadLoginReceiver;
use crate::profile::{ProfileResolver, Resolution};
use crate::session::{AuthChange, Session, SessionProvider};
use crate::storage::{CookieStore, LEAD_USER_ID_KEY, LocalStore, SESSION_COOKIE, cached_lead_id};

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const UI_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("auth reconciler has stopped")]
    Stopped,
}

/// Published auth state.
///
/// `loading` is true from the moment an identity change is seen until its
/// profile resolution lands. Serializes with a derived `isAuthenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub user: Option<AuthUser>,
    pub role: Role,
    pub loading: bool,
}

impl Serialize for AuthState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("AuthState", 4)?;
        state.serialize_field("user", &self.user)?;
        state.serialize_field("role", &self.role)?;
        state.serialize_field("loading", &self.loading)?;
        state.serialize_field("isAuthenticated", &self.is_authenticated())?;
        state.end()
    }
}

impl AuthState {
    /// State before anything is known.
    #[must_use]
    pub fn initial() -> Self {
        Self { user: None, role: Role::Guest, loading: true }
    }

    #[must_use]
    pub fn guest() -> Self {
        Self { user: None, role: Role::Guest, loading: false }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Hints for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiSignal {
    /// Open the sign-in dialog (sent after logout).
    OpenSignIn,
}

enum Command {
    Logout(oneshot::Sender<()>),
    Refresh,
}

struct Completed {
    generation: u64,
    subject: String,
    resolution: Resolution,
}

struct InFlight {
    generation: u64,
    subject: String,
    task: JoinHandle<()>,
}

pub struct Reconciler {
    sessions: Arc<dyn SessionProvider>,
    resolver: ProfileResolver,
    storage: Arc<dyn LocalStore>,
    cookies: Arc<dyn CookieStore>,
    leads: LeadLoginReceiver,
    state: watch::Sender<AuthState>,
    ui: broadcast::Sender<UiSignal>,
    generation: u64,
    current: AuthSource,
    last_resolved: Option<String>,
    in_flight: Option<InFlight>,
    completed_tx: mpsc::UnboundedSender<Completed>,
    completed_rx: mpsc::UnboundedReceiver<Completed>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        resolver: ProfileResolver,
        storage: Arc<dyn LocalStore>,
        cookies: Arc<dyn CookieStore>,
        leads: LeadLoginReceiver,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::initial());
        let (ui, _) = broadcast::channel(UI_CHANNEL_CAPACITY);
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            sessions,
            resolver,
            storage,
            cookies,
            leads,
            state,
            ui,
            generation: 0,
            current: AuthSource::None,
            last_resolved: None,
            in_flight: None,
            completed_tx,
            completed_rx,
        }
    }

    /// Start the reconciler task. It runs until every [`AuthHandle`] is dropped.
    #[must_use]
    pub fn spawn(self) -> AuthHandle {
        // Subscribe before mounting so no change between the initial read and
        // the first poll is lost.
        let events = self.sessions.subscribe();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = AuthHandle { state: self.state.subscribe(), commands: commands_tx, ui: self.ui.clone() };
        tokio::spawn(self.run(events, commands_rx));
        handle
    }

    async fn run(mut self, mut events: broadcast::Receiver<AuthChange>, mut commands: mpsc::Receiver<Command>) {
        self.mount().await;

        let mut events_open = true;
        loop {
            tokio::select! {
                change = events.recv(), if events_open => match change {
                    Ok(change) => {
                        tracing::debug!(event = ?change.event, "auth change");
                        self.on_session(change.session);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "auth events lagged; resyncing session");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("auth event stream closed");
                        events_open = false;
                    }
                },
                Some(lead) = self.leads.recv() => self.on_lead_login(lead.user_id),
                Some(done) = self.completed_rx.recv() => self.on_completed(done),
                command = commands.recv() => match command {
                    Some(Command::Logout(ack)) => {
                        self.logout().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Refresh) => self.refresh(),
                    None => break,
                },
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.task.abort();
        }
        tracing::debug!("auth reconciler stopped");
    }

    async fn mount(&mut self) {
        match self.sessions.get_session().await {
            Ok(Some(session)) => self.begin(AuthSource::SdkSession(session)),
            Ok(None) => self.fall_back_to_lead(),
            Err(e) => {
                tracing::warn!(error = %e, "session fetch failed on mount; continuing as guest");
                self.settle_guest();
            }
        }
    }

    async fn resync(&mut self) {
        match self.sessions.get_session().await {
            Ok(session) => self.on_session(session),
            Err(e) => tracing::warn!(error = %e, "session resync failed; keeping current state"),
        }
    }

    fn on_session(&mut self, session: Option<Session>) {
        let Some(session) = session else {
            self.last_resolved = None;
            self.fall_back_to_lead();
            return;
        };

        let subject = session.subject().to_owned();
        if self.in_flight.as_ref().is_some_and(|f| f.subject == subject) {
            tracing::debug!(subject = %subject, "resolution already in flight");
            self.keep_fresh_token(session);
            return;
        }
        // `last_resolved` is cleared whenever a resolution starts, so a match
        // here means nothing is in flight.
        if self.last_resolved.as_deref() == Some(subject.as_str()) {
            tracing::debug!(subject = %subject, "subject unchanged; skipping profile lookup");
            self.keep_fresh_token(session);
            self.set_loading(false);
            return;
        }
        self.begin(AuthSource::SdkSession(session));
    }

    /// Swap in a refreshed token for the current session so a later
    /// `refresh()` presents it.
    fn keep_fresh_token(&mut self, session: Session) {
        match &mut self.current {
            AuthSource::SdkSession(current) if current.subject() == session.subject() => *current = session,
            _ => {}
        }
    }

    fn on_lead_login(&mut self, lead_id: String) {
        tracing::info!(lead_id = %lead_id, "lead login");
        self.begin(AuthSource::LeadLogin(lead_id));
    }

    fn refresh(&mut self) {
        if self.current.subject().is_some() {
            self.begin(self.current.clone());
        }
    }

    fn fall_back_to_lead(&mut self) {
        match cached_lead_id(self.storage.as_ref()) {
            Some(lead_id) => self.begin(AuthSource::LeadLogin(lead_id)),
            None => self.settle_guest(),
        }
    }

    fn begin(&mut self, source: AuthSource) {
        let Some(subject) = source.subject().map(str::to_owned) else {
            self.settle_guest();
            return;
        };

        let generation = self.bump_generation();
        tracing::debug!(subject = %subject, source = source.kind(), generation, "resolving");
        self.current = source.clone();
        self.last_resolved = None;
        self.set_loading(true);

        let resolver = self.resolver.clone();
        let completed = self.completed_tx.clone();
        let task_subject = subject.clone();
        let task = tokio::spawn(async move {
            let resolution = resolver.resolve(&source).await;
            let _ = completed.send(Completed { generation, subject: task_subject, resolution });
        });
        self.in_flight = Some(InFlight { generation, subject, task });
    }

    fn on_completed(&mut self, done: Completed) {
        if done.generation != self.generation {
            tracing::debug!(
                subject = %done.subject,
                generation = done.generation,
                current = self.generation,
                "discarding stale resolution"
            );
            return;
        }
        if self.in_flight.as_ref().is_some_and(|f| f.generation == done.generation) {
            self.in_flight = None;
        }
        tracing::info!(subject = %done.subject, role = %done.resolution.role, "auth resolved");
        self.last_resolved = Some(done.subject);
        self.publish(AuthState { user: done.resolution.user, role: done.resolution.role, loading: false });
    }

    fn settle_guest(&mut self) {
        self.bump_generation();
        self.current = AuthSource::None;
        self.last_resolved = None;
        self.publish(AuthState::guest());
    }

    async fn logout(&mut self) {
        if let Err(e) = self.storage.remove(LEAD_USER_ID_KEY) {
            tracing::warn!(error = %e, "failed to clear cached lead id");
        }
        self.last_resolved = None;
        if let Err(e) = self.sessions.sign_out().await {
            tracing::warn!(error = %e, "backend sign-out failed; clearing local state anyway");
        }
        self.cookies.clear(SESSION_COOKIE);
        self.settle_guest();
        let _ = self.ui.send(UiSignal::OpenSignIn);
        tracing::info!("logged out");
    }

    /// Advance the generation and abort whatever was in flight.
    fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        if let Some(previous) = self.in_flight.take() {
            previous.task.abort();
        }
        self.generation
    }

    fn set_loading(&self, loading: bool) {
        let mut next = self.state.borrow().clone();
        next.loading = loading;
        self.publish(next);
    }

    fn publish(&self, next: AuthState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Read side of the published state plus the reconciler's command surface.
#[derive(Clone)]
pub struct AuthHandle {
    state: watch::Receiver<AuthState>,
    commands: mpsc::Sender<Command>,
    ui: broadcast::Sender<UiSignal>,
}

impl AuthHandle {
    /// Snapshot of the current state.
    #[must_use]
    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every published change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.clone()
    }

    #[must_use]
    pub fn ui_signals(&self) -> broadcast::Receiver<UiSignal> {
        self.ui.subscribe()
    }

    /// Wait until the state is not loading and return it.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcilerError::Stopped`] if the reconciler exits first.
    pub async fn settled(&self) -> Result<AuthState, ReconcilerError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| !s.loading)
            .await
            .map_err(|_| ReconcilerError::Stopped)?;
        Ok(state.clone())
    }

    /// Log out and wait until the guest state is published.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcilerError::Stopped`] if the reconciler is gone.
    pub async fn logout(&self) -> Result<(), ReconcilerError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Logout(ack))
            .await
            .map_err(|_| ReconcilerError::Stopped)?;
        done.await.map_err(|_| ReconcilerError::Stopped)
    }

    /// Re-resolve the current identity, e.g. after a profile edit.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcilerError::Stopped`] if the reconciler is gone.
    pub async fn refresh(&self) -> Result<(), ReconcilerError> {
        self.commands
            .send(Command::Refresh)
            .await
            .map_err(|_| ReconcilerError::Stopped)
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
