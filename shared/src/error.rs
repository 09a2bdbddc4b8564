//! Error taxonomy shared by every layer of the protocol.
//!
//! Decryption-path failures are deliberately collapsed: callers only ever see
//! [`CryptoError::Unreadable`], never which stage rejected the envelope.

use thiserror::Error;

pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("no key pair stored for tag {0}")]
    TagNotFound(String),
    #[error("a key pair already exists for tag {0}")]
    AlreadyExists(String),
    #[error("key pair generation failed")]
    GenerationFailed,
    #[error("signing with the stored key failed")]
    SigningFailed,
    #[error("key store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encrypted payload is unreadable")]
    Unreadable,
    #[error("payload could not be encrypted")]
    EncryptionFailed,
    #[error("message could not be signed")]
    SigningFailed,
}

/// Rejections raised while parsing an envelope, before any decryption.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported envelope algorithm")]
    UnsupportedAlgorithm,
}

/// Why the decryption pipeline dropped an envelope. Never shown to users.
#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("envelope references an unknown connection")]
    IdentityNotFound,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("connection store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no internet connection")]
    Unreachable,
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{class}: {message}")]
    Provider { class: String, message: String },
    #[error("unexpected response from provider: {0}")]
    MalformedResponse(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("connection is not active")]
    NotActive,
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl NetworkError {
    /// The single string shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            NetworkError::Unreachable => "No internet connection. Please try again.".to_string(),
            NetworkError::Timeout => "The provider did not respond in time. Please try again.".to_string(),
            NetworkError::Provider { message, .. } if !message.is_empty() => message.clone(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_decode() {
            NetworkError::MalformedResponse(err.to_string())
        } else {
            NetworkError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum CreationError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("provider response carried neither an access token nor a connect url")]
    MalformedResponse,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Redirect(String),
    #[error("connection is not awaiting a redirect")]
    InvalidState,
    #[error("url is not the configured return url")]
    NotRedirect,
}

impl CreationError {
    pub fn user_message(&self) -> String {
        match self {
            CreationError::Network(err) => err.user_message(),
            CreationError::Redirect(reason) => reason.clone(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}
