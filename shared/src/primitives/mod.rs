use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use url::Url;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte buffer wiped on drop. Holds symmetric keys, IVs and encoded private keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AutoZeroedByteArray(Vec<u8>);

impl AutoZeroedByteArray {
    pub fn new(bytes: Vec<u8>) -> AutoZeroedByteArray {
        AutoZeroedByteArray(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for AutoZeroedByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AutoZeroedByteArray({} bytes)", self.0.len())
    }
}

/// Handle of a key pair inside the key manager, derived 1:1 from a connection guid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyTag(String);

impl KeyTag {
    pub fn for_guid(guid: &str) -> KeyTag {
        KeyTag(format!("connection-key.{}", guid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for KeyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> AccessToken {
        AccessToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// In memory only, creation request not yet answered.
    Creating,
    AwaitingRedirect,
    Active,
    Revoked,
}

/// A paired session with a remote provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Assigned by the provider; empty until creation succeeds.
    #[serde(default)]
    pub id: String,
    pub guid: String,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub support_email: String,
    #[serde(default)]
    pub logo_url_string: String,
    pub base_url_string: String,
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(code: String, name: String, base_url_string: String) -> Connection {
        Connection {
            id: String::new(),
            guid: Uuid::new_v4().to_string(),
            code,
            name,
            support_email: String::new(),
            logo_url_string: String::new(),
            base_url_string,
            access_token: None,
            status: ConnectionStatus::Creating,
            created_at: Utc::now(),
        }
    }

    pub fn key_tag(&self) -> KeyTag {
        KeyTag::for_guid(&self.guid)
    }

    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.base_url_string)
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active && !self.id.is_empty() && self.access_token.is_some()
    }

    pub fn is_awaiting_redirect(&self) -> bool {
        self.status == ConnectionStatus::AwaitingRedirect
    }

    pub(crate) fn activate(&mut self, token: AccessToken) {
        self.access_token = Some(token);
        self.status = ConnectionStatus::Active;
    }

    pub(crate) fn await_redirect(&mut self) {
        self.access_token = None;
        self.status = ConnectionStatus::AwaitingRedirect;
    }

    pub(crate) fn mark_revoked(&mut self) {
        self.access_token = None;
        self.status = ConnectionStatus::Revoked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guids_and_tags_are_unique_per_connection() {
        let a = Connection::new("demo".into(), "Demo".into(), "https://demo.test".into());
        let b = Connection::new("demo".into(), "Demo".into(), "https://demo.test".into());
        assert_ne!(a.guid, b.guid);
        assert_ne!(a.key_tag(), b.key_tag());
        assert_eq!(a.key_tag(), KeyTag::for_guid(&a.guid));
    }

    #[test]
    fn activation_and_redirect_are_exclusive() {
        let mut connection = Connection::new("demo".into(), "Demo".into(), "https://demo.test".into());
        connection.id = "1".into();
        connection.await_redirect();
        assert!(connection.is_awaiting_redirect());
        assert!(!connection.is_active());

        connection.activate(AccessToken::new("token"));
        assert!(connection.is_active());
        assert!(!connection.is_awaiting_redirect());

        connection.mark_revoked();
        assert!(!connection.is_active());
        assert!(connection.access_token.is_none());
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let token = AccessToken::new("super-secret");
        assert!(!format!("{:?}", token).contains("super-secret"));
        let bytes = AutoZeroedByteArray::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", bytes), "AutoZeroedByteArray(3 bytes)");
    }
}
