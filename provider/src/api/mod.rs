pub mod admin;
pub mod authorizations;
pub mod connections;

use axum::{
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use shared::{
    crypto::{self, keys::public_key_from_pem, verify_signature},
    envelope::Envelope,
    error::CryptoError,
    flows::{signature_message, ACCESS_TOKEN_HEADER, EXPIRES_AT_HEADER, SIGNATURE_HEADER},
    rpc::{Data, ProviderErrorResponse},
    utils::b64_decode,
};

use crate::models::{ConnectionRow, STATUS_ACTIVE};
use crate::AppState;

pub type ApiResult<T> = Result<Json<Data<T>>, ApiError>;

/// Rendered as `{ "error_class": ..., "error_message": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    class: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, class: &'static str, message: impl Into<String>) -> ApiError {
        ApiError {
            status,
            class,
            message: message.into(),
        }
    }

    pub fn bad_request(class: &'static str, message: impl Into<String>) -> ApiError {
        ApiError::new(StatusCode::BAD_REQUEST, class, message)
    }

    pub fn unauthorized(class: &'static str, message: impl Into<String>) -> ApiError {
        ApiError::new(StatusCode::UNAUTHORIZED, class, message)
    }

    pub fn not_found(class: &'static str, message: impl Into<String>) -> ApiError {
        ApiError::new(StatusCode::NOT_FOUND, class, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ProviderErrorResponse {
            error_class: self.class.to_string(),
            error_message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "Something went wrong")
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        tracing::error!(error = %err, "could not encrypt payload");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "EncryptionFailed", "Something went wrong")
    }
}

pub fn data<T>(value: T) -> Json<Data<T>> {
    Json(Data::new(value))
}

pub fn generate_access_token() -> String {
    let mut token = [0u8; 32];
    OsRng.fill_bytes(&mut token);
    hex::encode(token)
}

/// Encrypts `payload` for the device holding `connection`'s private key.
pub fn seal<T: Serialize>(payload: &T, connection: &ConnectionRow) -> Result<Envelope, ApiError> {
    let public_key = public_key_from_pem(&connection.public_key).ok_or(CryptoError::EncryptionFailed)?;
    Ok(crypto::encrypt(payload, &public_key)?.with_connection_id(connection.id.to_string()))
}

/// Resolves the active connection a signed request comes from and checks its
/// signature over method, public url, expiry and body.
pub async fn authenticate(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &str,
) -> Result<ConnectionRow, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    let access_token = header(ACCESS_TOKEN_HEADER)
        .ok_or_else(|| ApiError::unauthorized("AccessTokenMissing", "Access token is missing"))?;
    let expires_at: i64 = header(EXPIRES_AT_HEADER)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| ApiError::bad_request("ExpiresAtMissing", "Expires-At header is missing or invalid"))?;
    if expires_at < Utc::now().timestamp() {
        return Err(ApiError::unauthorized("ActionExpired", "Request has expired"));
    }
    let signature = header(SIGNATURE_HEADER)
        .and_then(b64_decode)
        .ok_or_else(|| ApiError::unauthorized("SignatureMissing", "Signature is missing or invalid"))?;

    let connection: Option<ConnectionRow> = sqlx::query_as(
        "
        SELECT *
        FROM connections
        WHERE access_token = ?
            AND status = ?
    ",
    )
    .bind(access_token)
    .bind(STATUS_ACTIVE)
    .fetch_optional(&state.pool)
    .await?;
    let connection =
        connection.ok_or_else(|| ApiError::unauthorized("ConnectionNotFound", "Connection was not found"))?;

    let public_key = public_key_from_pem(&connection.public_key)
        .ok_or_else(|| ApiError::unauthorized("InvalidSignature", "Signature could not be verified"))?;
    let path = uri.path_and_query().map(|path| path.as_str()).unwrap_or_else(|| uri.path());
    let url = format!("{}{}", state.config.public_url, path);
    let message = signature_message(method.as_str(), &url, expires_at, body);

    if !verify_signature(&public_key, message.as_bytes(), &signature) {
        return Err(ApiError::unauthorized("InvalidSignature", "Signature could not be verified"));
    }
    Ok(connection)
}
