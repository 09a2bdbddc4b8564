//! Transport container for encrypted authorization and consent payloads.

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// The only symmetric scheme an envelope may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "AES-256-CBC")]
    Aes256Cbc,
}

impl Algorithm {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Cbc => "AES-256-CBC",
        }
    }
}

/// `{ data, key, iv, connection_id, algorithm }` on the wire.
///
/// `key` and `iv` are each wrapped with the recipient's RSA public key; `data`
/// is the AES-256-CBC ciphertext of the JSON payload. Every binary field is
/// standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "data")]
    pub cipher_data: String,
    #[serde(rename = "key")]
    pub wrapped_key: String,
    #[serde(rename = "iv")]
    pub wrapped_iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub algorithm: Algorithm,
}

impl Envelope {
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Envelope {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Parses an envelope, rejecting any `algorithm` other than AES-256-CBC
    /// before the payload is looked at.
    pub fn from_value(value: serde_json::Value) -> Result<Envelope, EnvelopeError> {
        match value.get("algorithm").and_then(|a| a.as_str()) {
            Some(algorithm) if algorithm == Algorithm::Aes256Cbc.as_str() => {}
            Some(_) => return Err(EnvelopeError::UnsupportedAlgorithm),
            None => {}
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json(json: &str) -> Result<Envelope, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Envelope::from_value(value)
    }
}
