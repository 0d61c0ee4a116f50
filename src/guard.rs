//! Role gates over the published auth state.
//!
//! A gate never decides while the state is loading; it reports
//! [`Access::Pending`] and the caller shows a placeholder. Once loading
//! clears, access is granted or denied with a redirect target. Nothing here
//! polls: [`wait_for_access`] rides the reconciler's `watch` channel.

use tokio::sync::watch;

use crate::identity::Role;
use crate::reconciler::AuthState;

pub const LOGIN_PATH: &str = "/login";
pub const ADMIN_LOGIN_PATH: &str = "/admin/login";
pub const HOME_PATH: &str = "/";

/// What a route requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Public,
    Authenticated,
    Admin,
}

impl Gate {
    /// Gate for a request path.
    #[must_use]
    pub fn for_path(path: &str) -> Self {
        if path == ADMIN_LOGIN_PATH || path.starts_with("/admin/login/") {
            return Self::Public;
        }
        if has_segment_prefix(path, "/admin") {
            return Self::Admin;
        }
        if has_segment_prefix(path, "/dashboard") || has_segment_prefix(path, "/profile") {
            return Self::Authenticated;
        }
        Self::Public
    }
}

/// `/admin` matches `/admin` and `/admin/x` but not `/administrator`.
fn has_segment_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Auth is still resolving; render a placeholder.
    Pending,
    Granted,
    Denied { redirect: &'static str },
}

impl Access {
    #[must_use]
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Decide `gate` against `state`.
#[must_use]
pub fn evaluate(state: &AuthState, gate: Gate) -> Access {
    if state.loading {
        return Access::Pending;
    }
    match gate {
        Gate::Public => Access::Granted,
        Gate::Authenticated if state.is_authenticated() => Access::Granted,
        Gate::Authenticated => Access::Denied { redirect: LOGIN_PATH },
        Gate::Admin if state.is_authenticated() && state.role == Role::Admin => Access::Granted,
        Gate::Admin if state.is_authenticated() => Access::Denied { redirect: HOME_PATH },
        Gate::Admin => Access::Denied { redirect: ADMIN_LOGIN_PATH },
    }
}

/// True once auth has loaded and nobody is signed in.
#[must_use]
pub fn should_redirect_unauth(state: &AuthState) -> bool {
    !state.loading && state.user.is_none()
}

/// Wait until loading clears, then decide.
///
/// If the reconciler has stopped, the last published state is decided as-is,
/// which yields [`Access::Pending`] only when it stopped mid-resolution.
pub async fn wait_for_access(rx: &mut watch::Receiver<AuthState>, gate: Gate) -> Access {
    if let Ok(state) = rx.wait_for(|s| !s.loading).await {
        return evaluate(&state, gate);
    }
    evaluate(&rx.borrow(), gate)
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
