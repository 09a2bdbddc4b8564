//! Reference provider for the authenticator connection protocol.

pub mod api;
pub mod config;
pub mod db;
pub mod models;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::ProviderConfig;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<ProviderConfig>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/authenticator/v1/configuration", get(api::connections::configuration))
        .route(
            "/api/authenticator/v1/connections",
            post(api::connections::create_connection).delete(api::connections::revoke_connection),
        )
        .route("/oauth/:id", get(api::connections::oauth_redirect))
        .route("/api/authenticator/v1/authorizations", get(api::authorizations::list_authorizations))
        .route(
            "/api/authenticator/v1/authorizations/:id",
            get(api::authorizations::show_authorization).put(api::authorizations::answer_authorization),
        )
        .route("/api/authenticator/v1/consents", get(api::authorizations::list_consents))
        .route("/admin/connections/:id/authorizations", post(api::admin::create_authorization))
        .route("/admin/connections/:id/consents", post(api::admin::create_consent))
        .route("/admin/authorizations/:id", get(api::admin::authorization_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Fresh in-memory database with the schema applied.
pub async fn init_state(config: ProviderConfig) -> Result<AppState, sqlx::Error> {
    let pool = db::connect_in_memory().await?;
    db::run_migrations(&pool).await?;

    Ok(AppState {
        pool,
        config: Arc::new(config),
    })
}
