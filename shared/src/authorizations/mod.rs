//! Decrypted authorization and consent payloads, and the pipeline that
//! recovers them from envelopes.

pub mod collection;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{self, keys::KeyManager, keys::KeyStore};
use crate::envelope::Envelope;
use crate::error::{CryptoError, DecryptionError};
use crate::rpc::string_or_number;
use crate::store::ConnectionStore;

pub use collection::{AuthorizationState, AuthorizationViewModel, AuthorizationsCollection};

/// Payloads with a lifetime window.
pub trait Expiring {
    fn connection_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn expires_at(&self) -> DateTime<Utc>;

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedAuthorization {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub connection_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Expiring for DecryptedAuthorization {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentAccount {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iban: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentSharedData {
    #[serde(default)]
    pub balance: bool,
    #[serde(default)]
    pub transactions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedConsent {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub connection_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub tpp_name: String,
    pub consent_type: String,
    #[serde(default)]
    pub accounts: Vec<ConsentAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_data: Option<ConsentSharedData>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Expiring for DecryptedConsent {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Resolves the connection an envelope is addressed to and opens it with
/// that connection's private key.
///
/// Every failure (unknown connection, missing key, unreadable payload, a
/// payload whose window or owner does not check out) yields `None`. Nothing
/// is mutated.
pub struct AuthorizationDecryptor<'a, C: ?Sized, S> {
    connections: &'a C,
    keys: &'a KeyManager<S>,
}

impl<'a, C: ConnectionStore + ?Sized, S: KeyStore> AuthorizationDecryptor<'a, C, S> {
    pub fn new(connections: &'a C, keys: &'a KeyManager<S>) -> AuthorizationDecryptor<'a, C, S> {
        AuthorizationDecryptor { connections, keys }
    }

    pub fn decrypt_authorization(&self, envelope: &Envelope) -> Option<DecryptedAuthorization> {
        self.open(envelope)
    }

    pub fn decrypt_consent(&self, envelope: &Envelope) -> Option<DecryptedConsent> {
        self.open(envelope)
    }

    /// Decrypts a batch, keeping arrival order and skipping failures.
    pub fn decrypt_authorizations<'e>(
        &self,
        envelopes: impl IntoIterator<Item = &'e Envelope>,
    ) -> Vec<DecryptedAuthorization> {
        envelopes
            .into_iter()
            .filter_map(|envelope| self.decrypt_authorization(envelope))
            .collect()
    }

    pub fn decrypt_consents<'e>(&self, envelopes: impl IntoIterator<Item = &'e Envelope>) -> Vec<DecryptedConsent> {
        envelopes
            .into_iter()
            .filter_map(|envelope| self.decrypt_consent(envelope))
            .collect()
    }

    fn open<T: DeserializeOwned + Expiring>(&self, envelope: &Envelope) -> Option<T> {
        match self.try_open(envelope) {
            Ok(payload) => Some(payload),
            Err(reason) => {
                debug!(
                    connection_id = envelope.connection_id.as_deref().unwrap_or_default(),
                    reason = %reason,
                    "dropping envelope"
                );
                None
            }
        }
    }

    fn try_open<T: DeserializeOwned + Expiring>(&self, envelope: &Envelope) -> Result<T, DecryptionError> {
        let connection_id = envelope
            .connection_id
            .as_deref()
            .ok_or(DecryptionError::IdentityNotFound)?;
        let connection = self
            .connections
            .find_by_id(connection_id)?
            .ok_or(DecryptionError::IdentityNotFound)?;

        let private_key = self.keys.private_key(&connection.key_tag())?;
        let payload: T = crypto::decrypt(envelope, &private_key)?;

        if payload.connection_id() != connection.id || payload.expires_at() <= payload.created_at() {
            return Err(CryptoError::Unreadable.into());
        }

        Ok(payload)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{active_connection, authorization_message};
    use super::*;
    use crate::crypto::keys::InMemoryKeyStore;
    use crate::store::InMemoryConnectionStore;
    use chrono::Duration;
    use serde_json::json;

    fn setup() -> (InMemoryConnectionStore, KeyManager<InMemoryKeyStore>) {
        (
            InMemoryConnectionStore::new(),
            KeyManager::with_modulus_bits(InMemoryKeyStore::new(), 1024),
        )
    }

    #[test]
    fn decrypts_authorization_for_known_connection() {
        let (store, keys) = setup();
        let connection = active_connection("12345", &store, &keys);
        let public_key = keys.public_key(&connection.key_tag()).unwrap();

        let envelope = crypto::encrypt(&authorization_message("00000", "12345", "Authorization"), &public_key)
            .unwrap()
            .with_connection_id("12345");

        let decryptor = AuthorizationDecryptor::new(&store, &keys);
        let authorization = decryptor.decrypt_authorization(&envelope).unwrap();
        assert_eq!(authorization.id, "00000");
        assert_eq!(authorization.connection_id, "12345");
        assert_eq!(authorization.title, "Authorization");
        assert!(!authorization.is_expired(Utc::now()));
    }

    #[test]
    fn unknown_connection_never_resolves() {
        let (store, keys) = setup();
        let connection = active_connection("12345", &store, &keys);
        let public_key = keys.public_key(&connection.key_tag()).unwrap();

        let envelope = crypto::encrypt(&authorization_message("00000", "113223", "Zombie"), &public_key)
            .unwrap()
            .with_connection_id("113223");
        let decryptor = AuthorizationDecryptor::new(&store, &keys);
        assert!(decryptor.decrypt_authorization(&envelope).is_none());

        let mut anonymous = envelope.clone();
        anonymous.connection_id = None;
        assert!(decryptor.decrypt_authorization(&anonymous).is_none());
    }

    #[test]
    fn deleted_key_pair_yields_none() {
        let (store, keys) = setup();
        let connection = active_connection("12345", &store, &keys);
        let public_key = keys.public_key(&connection.key_tag()).unwrap();
        let envelope = crypto::encrypt(&authorization_message("00000", "12345", "Authorization"), &public_key)
            .unwrap()
            .with_connection_id("12345");

        keys.delete_key_pair(&connection.key_tag()).unwrap();
        assert!(AuthorizationDecryptor::new(&store, &keys)
            .decrypt_authorization(&envelope)
            .is_none());
    }

    #[test]
    fn payloads_with_bad_window_or_owner_are_dropped() {
        let (store, keys) = setup();
        let connection = active_connection("12345", &store, &keys);
        let public_key = keys.public_key(&connection.key_tag()).unwrap();
        let decryptor = AuthorizationDecryptor::new(&store, &keys);

        let mut inverted = authorization_message("00000", "12345", "Authorization");
        inverted["expires_at"] = json!((Utc::now() - Duration::minutes(5)).to_rfc3339());
        let envelope = crypto::encrypt(&inverted, &public_key).unwrap().with_connection_id("12345");
        assert!(decryptor.decrypt_authorization(&envelope).is_none());

        let foreign = authorization_message("00000", "99999", "Authorization");
        let envelope = crypto::encrypt(&foreign, &public_key).unwrap().with_connection_id("12345");
        assert!(decryptor.decrypt_authorization(&envelope).is_none());
    }

    #[test]
    fn consent_payloads_decrypt_and_authorizations_do_not_pass_as_consents() {
        let (store, keys) = setup();
        let connection = active_connection("12345", &store, &keys);
        let public_key = keys.public_key(&connection.key_tag()).unwrap();
        let decryptor = AuthorizationDecryptor::new(&store, &keys);

        let consent = json!({
            "id": 77,
            "connection_id": "12345",
            "tpp_name": "Fentury",
            "consent_type": "aisp",
            "accounts": [{ "name": "Current account", "iban": "DE89370400440532013000" }],
            "shared_data": { "balance": true, "transactions": false },
            "created_at": Utc::now().to_rfc3339(),
            "expires_at": (Utc::now() + Duration::days(90)).to_rfc3339(),
        });
        let envelope = crypto::encrypt(&consent, &public_key).unwrap().with_connection_id("12345");
        let decrypted = decryptor.decrypt_consent(&envelope).unwrap();
        assert_eq!(decrypted.id, "77");
        assert_eq!(decrypted.accounts.len(), 1);
        assert_eq!(decrypted.shared_data, Some(ConsentSharedData { balance: true, transactions: false }));

        let authorization = crypto::encrypt(&authorization_message("1", "12345", "A"), &public_key)
            .unwrap()
            .with_connection_id("12345");
        assert!(decryptor.decrypt_consent(&authorization).is_none());
    }

    #[test]
    fn batch_decryption_keeps_order_and_skips_failures() {
        let (store, keys) = setup();
        let connection = active_connection("12345", &store, &keys);
        let public_key = keys.public_key(&connection.key_tag()).unwrap();

        let first = crypto::encrypt(&authorization_message("00000", "12345", "First"), &public_key)
            .unwrap()
            .with_connection_id("12345");
        let mut broken = first.clone();
        broken.wrapped_key = "AAAA".into();
        let second = crypto::encrypt(&authorization_message("00001", "12345", "Second"), &public_key)
            .unwrap()
            .with_connection_id("12345");

        let decrypted = AuthorizationDecryptor::new(&store, &keys).decrypt_authorizations(&[first, broken, second]);
        let ids: Vec<_> = decrypted.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["00000", "00001"]);
    }
}
