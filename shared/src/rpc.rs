use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::envelope::Envelope;

/// Every provider request and response body is wrapped as `{ "data": ... }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Data<T> {
    pub data: T,
}

impl<T> Data<T> {
    pub fn new(data: T) -> Data<T> {
        Data { data }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    pub connect_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConnectionRequest {
    pub public_key: String,
    pub return_url: String,
    pub platform: String,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_query: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConnectionResponse {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeConnectionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmAuthorizationRequest {
    pub confirm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfirmAuthorizationResponse {
    pub success: bool,
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderErrorResponse {
    pub error_class: String,
    #[serde(default)]
    pub error_message: String,
}

/// Reads `{ "data": [envelope, ...] }`, dropping entries that fail to parse.
pub fn parse_envelope_list(body: Value) -> Option<Vec<Envelope>> {
    let Value::Array(items) = body.get("data")?.clone() else {
        return None;
    };

    Some(
        items
            .into_iter()
            .filter_map(|item| match Envelope::from_value(item) {
                Ok(envelope) => Some(envelope),
                Err(err) => {
                    debug!(error = %err, "skipping envelope");
                    None
                }
            })
            .collect(),
    )
}

pub fn parse_single_envelope(body: Value) -> Option<Envelope> {
    Envelope::from_value(body.get("data")?.clone()).ok()
}

pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_lists_skip_bad_entries() {
        let body = json!({
            "data": [
                { "data": "a", "key": "b", "iv": "c", "connection_id": "1", "algorithm": "AES-256-CBC" },
                { "data": "a", "key": "b", "iv": "c", "connection_id": "1", "algorithm": "DES" },
                { "data": "a" }
            ]
        });
        let envelopes = parse_envelope_list(body).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].connection_id.as_deref(), Some("1"));

        assert!(parse_envelope_list(json!({ "data": {} })).is_none());
        assert!(parse_envelope_list(json!({})).is_none());
    }

    #[test]
    fn ids_may_be_numeric() {
        let response: Data<CreateConnectionResponse> =
            serde_json::from_value(json!({ "data": { "id": 333, "connect_url": "https://p.test/oauth/333" } }))
                .unwrap();
        assert_eq!(response.data.id, "333");
        assert!(response.data.access_token.is_none());
    }
}
