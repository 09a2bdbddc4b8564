use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use shared::{
    crypto::keys::public_key_from_pem,
    rpc::{CreateConnectionRequest, CreateConnectionResponse, Data, ProviderResponse, RevokeConnectionResponse},
};
use url::Url;

use super::{authenticate, data, generate_access_token, ApiError, ApiResult};
use crate::models::{ConnectionRow, STATUS_ACTIVE, STATUS_PENDING, STATUS_REVOKED};
use crate::AppState;

pub async fn configuration(State(state): State<AppState>) -> Json<Data<ProviderResponse>> {
    let config = &state.config;
    data(ProviderResponse {
        code: config.code.clone(),
        name: config.name.clone(),
        support_email: Some(config.support_email.clone()),
        logo_url: config.logo_url.clone(),
        connect_url: config.public_url.clone(),
        version: Some("1".to_string()),
    })
}

/// Connections created with a `connect_query` are pre-authenticated and get
/// a token straight away; the rest go through the web flow at `/oauth/{id}`.
pub async fn create_connection(
    State(state): State<AppState>,
    Json(payload): Json<Data<CreateConnectionRequest>>,
) -> ApiResult<CreateConnectionResponse> {
    let request = payload.data;
    if public_key_from_pem(&request.public_key).is_none() {
        return Err(ApiError::bad_request("InvalidPublicKey", "Public key is not a valid PEM"));
    }
    if Url::parse(&request.return_url).is_err() {
        return Err(ApiError::bad_request("InvalidReturnUrl", "Return url is not valid"));
    }

    let access_token = request.connect_query.as_ref().map(|_| generate_access_token());
    let status = if access_token.is_some() { STATUS_ACTIVE } else { STATUS_PENDING };

    let id: i64 = sqlx::query_scalar(
        "
        INSERT INTO connections
        (public_key, return_url, platform, push_token, access_token, status, created_at)
        VALUES
        (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
    ",
    )
    .bind(&request.public_key)
    .bind(&request.return_url)
    .bind(&request.platform)
    .bind(&request.push_token)
    .bind(&access_token)
    .bind(status)
    .bind(Utc::now())
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(id, status, platform = %request.platform, "connection created");

    let connect_url = match access_token {
        Some(_) => None,
        None => Some(format!("{}/oauth/{}", state.config.public_url, id)),
    };
    Ok(data(CreateConnectionResponse {
        id: id.to_string(),
        access_token,
        connect_url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct OauthQuery {
    /// `deny` ends the web flow with `AccessDenied`.
    pub decision: Option<String>,
}

/// Stands in for the provider's login page: activates the connection and
/// sends the user back to the device's return url.
pub async fn oauth_redirect(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<OauthQuery>,
) -> Result<Response, ApiError> {
    let connection: Option<ConnectionRow> = sqlx::query_as(
        "
        SELECT *
        FROM connections
        WHERE id = ?
    ",
    )
    .bind(id)
    .fetch_optional(&state.pool)
    .await?;
    let connection = connection.ok_or_else(|| ApiError::not_found("ConnectionNotFound", "Connection was not found"))?;

    let mut location = Url::parse(&connection.return_url)
        .map_err(|_| ApiError::bad_request("InvalidReturnUrl", "Return url is not valid"))?;

    if connection.status != STATUS_PENDING {
        location.query_pairs_mut().append_pair("error_class", "ConnectionNotPending");
    } else if query.decision.as_deref() == Some("deny") {
        sqlx::query("UPDATE connections SET status = ? WHERE id = ?")
            .bind(STATUS_REVOKED)
            .bind(id)
            .execute(&state.pool)
            .await?;
        location.query_pairs_mut().append_pair("error_class", "AccessDenied");
    } else {
        let access_token = generate_access_token();
        sqlx::query("UPDATE connections SET status = ?, access_token = ? WHERE id = ?")
            .bind(STATUS_ACTIVE)
            .bind(&access_token)
            .bind(id)
            .execute(&state.pool)
            .await?;
        tracing::info!(id, "connection authorized through web flow");
        location.query_pairs_mut().append_pair("access_token", &access_token);
    }

    Ok((StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response())
}

pub async fn revoke_connection(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> ApiResult<RevokeConnectionResponse> {
    let connection = authenticate(&state, &method, &uri, &headers, "").await?;

    sqlx::query("UPDATE connections SET status = ? WHERE id = ?")
        .bind(STATUS_REVOKED)
        .bind(connection.id)
        .execute(&state.pool)
        .await?;
    tracing::info!(id = connection.id, "connection revoked by device");

    Ok(data(RevokeConnectionResponse {
        success: true,
        access_token: connection.access_token,
    }))
}
