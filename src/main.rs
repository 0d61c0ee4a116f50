use std::sync::Arc;

use marketplace_auth::config::AuthConfig;
use marketplace_auth::otp::lead_login_channel;
use marketplace_auth::profile::{ProfileResolver, ProfileStore};
use marketplace_auth::session::SessionProvider;
use marketplace_auth::storage::{CookieStore, FileLocalStore, LocalStore, MemoryCookieJar};
use marketplace_auth::store::{PgProfileStore, RestProfileStore};
use marketplace_auth::supabase::SupabaseAuth;
use marketplace_auth::{Reconciler, db, guard};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = AuthConfig::from_env().expect("auth config required");
    let storage: Arc<dyn LocalStore> =
        Arc::new(FileLocalStore::open(&config.storage_path).expect("failed to open auth storage"));
    let cookies: Arc<dyn CookieStore> = Arc::new(MemoryCookieJar::new());

    let sessions: Arc<dyn SessionProvider> =
        Arc::new(SupabaseAuth::from_config(&config, storage.clone()).expect("supabase client init failed"));

    // Direct Postgres when configured, PostgREST otherwise.
    let profiles: Arc<dyn ProfileStore> = match db::init_pool(&config).await.expect("database init failed") {
        Some(pool) => {
            tracing::info!("profiles via postgres");
            Arc::new(PgProfileStore::new(pool))
        }
        None => {
            tracing::info!(table = %config.profile_table, "profiles via rest");
            Arc::new(RestProfileStore::from_config(&config).expect("profile client init failed"))
        }
    };

    // Held for the process lifetime so the lead-login channel stays open.
    let (_leads, lead_rx) = lead_login_channel();

    let handle = Reconciler::new(sessions, ProfileResolver::new(profiles), storage, cookies, lead_rx).spawn();

    let mut states = handle.subscribe();
    loop {
        {
            let state = states.borrow_and_update();
            let user = state.user.as_ref().map(|u| u.uid.as_str());
            tracing::info!(
                ?user,
                role = %state.role,
                loading = state.loading,
                admin_access = ?guard::evaluate(&state, guard::Gate::Admin),
                "auth state"
            );
        }
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
}
