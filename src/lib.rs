//! Client-side auth reconciliation for the marketplace frontend.
//!
//! SYSTEM CONTEXT
//! ==============
//! Three identity sources feed one published `{user, role, loading}` view:
//! the Supabase session, an OTP-only "lead" login cached locally, and the
//! profile row that carries the role. [`reconciler`] owns that view; [`guard`]
//! reads it; everything else is an adapter it drives.

pub mod config;
pub mod db;
pub mod guard;
pub mod identity;
pub mod otp;
pub mod profile;
pub mod reconciler;
pub mod session;
pub mod storage;
pub mod store;
pub mod supabase;

pub use config::AuthConfig;
pub use guard::{Access, Gate};
pub use identity::{AuthSource, AuthUser, Role};
pub use reconciler::{AuthHandle, AuthState, Reconciler, UiSignal};
