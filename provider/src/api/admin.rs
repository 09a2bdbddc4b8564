//! Back-office endpoints standing in for the bank's own systems.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    authorizations::{ConsentAccount, ConsentSharedData},
    rpc::Data,
};

use super::{data, ApiError};
use crate::models::{AuthorizationRow, STATUS_ACTIVE, STATUS_PENDING};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NewAuthorization {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub authorization_code: Option<String>,
    /// Overrides the configured lifetime.
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct NewConsent {
    pub tpp_name: String,
    pub consent_type: String,
    #[serde(default)]
    pub accounts: Vec<ConsentAccount>,
    pub shared_data: Option<ConsentSharedData>,
    #[serde(default = "default_consent_days")]
    pub ttl_days: i64,
}

fn default_consent_days() -> i64 {
    90
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct AuthorizationStatus {
    pub id: String,
    pub status: String,
}

/// `created_at + ttl`, rejecting lifetimes that are not positive or do not fit a timestamp.
fn expiry(
    created_at: DateTime<Utc>,
    ttl: i64,
    unit: fn(i64) -> Option<Duration>,
) -> Result<DateTime<Utc>, ApiError> {
    Some(ttl)
        .filter(|ttl| *ttl > 0)
        .and_then(unit)
        .and_then(|lifetime| created_at.checked_add_signed(lifetime))
        .ok_or_else(|| ApiError::bad_request("InvalidLifetime", "Lifetime must be positive and bounded"))
}

async fn ensure_active(state: &AppState, connection_id: i64) -> Result<(), ApiError> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM connections WHERE id = ?")
        .bind(connection_id)
        .fetch_optional(&state.pool)
        .await?;

    match status.as_deref() {
        Some(STATUS_ACTIVE) => Ok(()),
        _ => Err(ApiError::not_found("ConnectionNotFound", "Connection was not found")),
    }
}

pub async fn create_authorization(
    State(state): State<AppState>,
    Path(connection_id): Path<i64>,
    Json(payload): Json<NewAuthorization>,
) -> Result<(StatusCode, Json<Data<Created>>), ApiError> {
    ensure_active(&state, connection_id).await?;

    let created_at = Utc::now();
    let ttl = payload.ttl_secs.unwrap_or(state.config.authorization_ttl_secs);
    let expires_at = expiry(created_at, ttl, Duration::try_seconds)?;

    let id: i64 = sqlx::query_scalar(
        "
        INSERT INTO authorizations
        (connection_id, title, description, authorization_code, status, created_at, expires_at)
        VALUES
        (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
    ",
    )
    .bind(connection_id)
    .bind(&payload.title)
    .bind(&payload.description)
    .bind(&payload.authorization_code)
    .bind(STATUS_PENDING)
    .bind(created_at)
    .bind(expires_at)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(id, connection_id, "authorization created");
    Ok((StatusCode::CREATED, data(Created { id: id.to_string() })))
}

pub async fn create_consent(
    State(state): State<AppState>,
    Path(connection_id): Path<i64>,
    Json(payload): Json<NewConsent>,
) -> Result<(StatusCode, Json<Data<Created>>), ApiError> {
    ensure_active(&state, connection_id).await?;

    let accounts = serde_json::to_string(&payload.accounts)
        .map_err(|_| ApiError::bad_request("InvalidRequest", "Accounts are malformed"))?;
    let shared_data = payload
        .shared_data
        .map(|shared_data| serde_json::to_string(&shared_data))
        .transpose()
        .map_err(|_| ApiError::bad_request("InvalidRequest", "Shared data is malformed"))?;
    let created_at = Utc::now();
    let expires_at = expiry(created_at, payload.ttl_days, Duration::try_days)?;

    let id: i64 = sqlx::query_scalar(
        "
        INSERT INTO consents
        (connection_id, tpp_name, consent_type, accounts, shared_data, created_at, expires_at)
        VALUES
        (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
    ",
    )
    .bind(connection_id)
    .bind(&payload.tpp_name)
    .bind(&payload.consent_type)
    .bind(accounts)
    .bind(shared_data)
    .bind(created_at)
    .bind(expires_at)
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, data(Created { id: id.to_string() })))
}

pub async fn authorization_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Data<AuthorizationStatus>>, ApiError> {
    let authorization: Option<AuthorizationRow> = sqlx::query_as("SELECT * FROM authorizations WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?;
    let authorization =
        authorization.ok_or_else(|| ApiError::not_found("AuthorizationNotFound", "Authorization was not found"))?;

    Ok(data(AuthorizationStatus {
        id: authorization.id.to_string(),
        status: authorization.status,
    }))
}
