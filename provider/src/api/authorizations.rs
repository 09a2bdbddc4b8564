use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
};
use chrono::Utc;
use shared::{
    envelope::Envelope,
    rpc::{ConfirmAuthorizationRequest, ConfirmAuthorizationResponse, Data},
};

use super::{authenticate, data, seal, ApiError, ApiResult};
use crate::models::{AuthorizationRow, ConnectionRow, ConsentRow, STATUS_CONFIRMED, STATUS_DENIED, STATUS_PENDING};
use crate::AppState;

async fn pending_authorization(
    state: &AppState,
    connection: &ConnectionRow,
    id: i64,
) -> Result<AuthorizationRow, ApiError> {
    let authorization: Option<AuthorizationRow> = sqlx::query_as(
        "
        SELECT *
        FROM authorizations
        WHERE id = ?
            AND connection_id = ?
            AND status = ?
    ",
    )
    .bind(id)
    .bind(connection.id)
    .bind(STATUS_PENDING)
    .fetch_optional(&state.pool)
    .await?;

    authorization
        .filter(|authorization| authorization.expires_at > Utc::now())
        .ok_or_else(|| ApiError::not_found("AuthorizationNotFound", "Authorization was not found"))
}

pub async fn list_authorizations(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> ApiResult<Vec<Envelope>> {
    let connection = authenticate(&state, &method, &uri, &headers, "").await?;

    let authorizations: Vec<AuthorizationRow> = sqlx::query_as(
        "
        SELECT *
        FROM authorizations
        WHERE connection_id = ?
            AND status = ?
        ORDER BY id
    ",
    )
    .bind(connection.id)
    .bind(STATUS_PENDING)
    .fetch_all(&state.pool)
    .await?;

    let now = Utc::now();
    let envelopes = authorizations
        .iter()
        .filter(|authorization| authorization.expires_at > now)
        .map(|authorization| seal(&authorization.payload(), &connection))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(data(envelopes))
}

pub async fn show_authorization(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> ApiResult<Envelope> {
    let connection = authenticate(&state, &method, &uri, &headers, "").await?;
    let authorization = pending_authorization(&state, &connection, id).await?;
    Ok(data(seal(&authorization.payload(), &connection)?))
}

pub async fn answer_authorization(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> ApiResult<ConfirmAuthorizationResponse> {
    let connection = authenticate(&state, &method, &uri, &headers, &body).await?;
    let request: Data<ConfirmAuthorizationRequest> = serde_json::from_str(&body)
        .map_err(|_| ApiError::bad_request("InvalidRequest", "Request body is malformed"))?;
    let request = request.data;

    let authorization = pending_authorization(&state, &connection, id).await?;
    if authorization.authorization_code.is_some() && authorization.authorization_code != request.authorization_code {
        return Err(ApiError::bad_request(
            "AuthorizationCodeMismatch",
            "Authorization code does not match",
        ));
    }

    let status = if request.confirm { STATUS_CONFIRMED } else { STATUS_DENIED };
    sqlx::query("UPDATE authorizations SET status = ? WHERE id = ?")
        .bind(status)
        .bind(authorization.id)
        .execute(&state.pool)
        .await?;
    tracing::info!(id = authorization.id, connection_id = connection.id, status, "authorization answered");

    Ok(data(ConfirmAuthorizationResponse {
        success: true,
        id: authorization.id.to_string(),
    }))
}

pub async fn list_consents(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> ApiResult<Vec<Envelope>> {
    let connection = authenticate(&state, &method, &uri, &headers, "").await?;

    let consents: Vec<ConsentRow> = sqlx::query_as(
        "
        SELECT *
        FROM consents
        WHERE connection_id = ?
        ORDER BY id
    ",
    )
    .bind(connection.id)
    .fetch_all(&state.pool)
    .await?;

    let now = Utc::now();
    let mut envelopes = Vec::with_capacity(consents.len());
    for consent in consents.iter().filter(|consent| consent.expires_at > now) {
        match consent.payload() {
            Ok(payload) => envelopes.push(seal(&payload, &connection)?),
            Err(err) => tracing::warn!(id = consent.id, error = %err, "skipping unreadable consent"),
        }
    }
    Ok(data(envelopes))
}
