//! Per-connection RSA key pairs, looked up by [`KeyTag`].

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use tracing::info;

use crate::crypto;
use crate::error::KeyError;
use crate::primitives::{AutoZeroedByteArray, KeyTag};

pub const DEFAULT_MODULUS_BITS: usize = 2048;

/// Backing storage for private keys, PKCS#1 DER encoded.
pub trait KeyStore: Send + Sync {
    fn get(&self, tag: &KeyTag) -> Result<Option<AutoZeroedByteArray>, KeyError>;
    fn put(&self, tag: &KeyTag, private_key_der: AutoZeroedByteArray) -> Result<(), KeyError>;
    /// Returns whether anything was removed.
    fn delete(&self, tag: &KeyTag) -> Result<bool, KeyError>;
}

#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    keys: DashMap<KeyTag, AutoZeroedByteArray>,
}

impl InMemoryKeyStore {
    pub fn new() -> InMemoryKeyStore {
        InMemoryKeyStore::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn get(&self, tag: &KeyTag) -> Result<Option<AutoZeroedByteArray>, KeyError> {
        Ok(self.keys.get(tag).map(|entry| entry.value().clone()))
    }

    fn put(&self, tag: &KeyTag, private_key_der: AutoZeroedByteArray) -> Result<(), KeyError> {
        self.keys.insert(tag.clone(), private_key_der);
        Ok(())
    }

    fn delete(&self, tag: &KeyTag) -> Result<bool, KeyError> {
        Ok(self.keys.remove(tag).is_some())
    }
}

impl<S: KeyStore + ?Sized> KeyStore for std::sync::Arc<S> {
    fn get(&self, tag: &KeyTag) -> Result<Option<AutoZeroedByteArray>, KeyError> {
        (**self).get(tag)
    }

    fn put(&self, tag: &KeyTag, private_key_der: AutoZeroedByteArray) -> Result<(), KeyError> {
        (**self).put(tag, private_key_der)
    }

    fn delete(&self, tag: &KeyTag) -> Result<bool, KeyError> {
        (**self).delete(tag)
    }
}

pub fn public_key_to_pem(public_key: &RsaPublicKey) -> Result<String, KeyError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| KeyError::GenerationFailed)
}

pub fn public_key_from_pem(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem.trim()).ok()
}

/// Generates, serves and deletes key pairs.
///
/// Creating a key pair for a tag that already has one is rejected with
/// [`KeyError::AlreadyExists`]: envelopes may still be in flight for the old
/// public key. Creation and deletion share one lock; lookups do not take it.
pub struct KeyManager<S> {
    store: S,
    modulus_bits: usize,
    lifecycle: Mutex<()>,
}

impl<S: KeyStore> KeyManager<S> {
    pub fn new(store: S) -> KeyManager<S> {
        KeyManager::with_modulus_bits(store, DEFAULT_MODULUS_BITS)
    }

    pub fn with_modulus_bits(store: S, modulus_bits: usize) -> KeyManager<S> {
        KeyManager {
            store,
            modulus_bits,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn create_key_pair(&self, tag: &KeyTag) -> Result<(), KeyError> {
        let _guard = self.lifecycle.lock();

        if self.store.get(tag)?.is_some() {
            return Err(KeyError::AlreadyExists(tag.to_string()));
        }

        let private_key =
            RsaPrivateKey::new(&mut OsRng, self.modulus_bits).map_err(|_| KeyError::GenerationFailed)?;
        let der = private_key.to_pkcs1_der().map_err(|_| KeyError::GenerationFailed)?;

        self.store.put(tag, AutoZeroedByteArray::new(der.as_bytes().to_vec()))?;
        info!(%tag, bits = self.modulus_bits, "created key pair");
        Ok(())
    }

    pub fn has_key_pair(&self, tag: &KeyTag) -> Result<bool, KeyError> {
        Ok(self.store.get(tag)?.is_some())
    }

    pub fn public_key(&self, tag: &KeyTag) -> Result<RsaPublicKey, KeyError> {
        Ok(RsaPublicKey::from(&self.private_key(tag)?))
    }

    pub fn public_key_pem(&self, tag: &KeyTag) -> Result<String, KeyError> {
        public_key_to_pem(&self.public_key(tag)?)
    }

    pub(crate) fn private_key(&self, tag: &KeyTag) -> Result<RsaPrivateKey, KeyError> {
        let der = self
            .store
            .get(tag)?
            .ok_or_else(|| KeyError::TagNotFound(tag.to_string()))?;

        RsaPrivateKey::from_pkcs1_der(der.as_slice())
            .map_err(|_| KeyError::StoreUnavailable(format!("stored key for {} is unreadable", tag)))
    }

    pub fn delete_key_pair(&self, tag: &KeyTag) -> Result<(), KeyError> {
        let _guard = self.lifecycle.lock();

        if self.store.delete(tag)? {
            info!(%tag, "deleted key pair");
            Ok(())
        } else {
            Err(KeyError::TagNotFound(tag.to_string()))
        }
    }

    pub fn sign(&self, tag: &KeyTag, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let private_key = self.private_key(tag)?;
        crypto::sign(&private_key, message).map_err(|_| KeyError::SigningFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn manager() -> KeyManager<InMemoryKeyStore> {
        KeyManager::with_modulus_bits(InMemoryKeyStore::new(), 1024)
    }

    #[test]
    fn create_then_fetch_public_and_private_halves() {
        let keys = manager();
        let tag = KeyTag::for_guid("guid-1");
        keys.create_key_pair(&tag).unwrap();

        assert!(keys.has_key_pair(&tag).unwrap());
        let public_key = keys.public_key(&tag).unwrap();
        let envelope = crypto::encrypt(&json!({ "id": "1" }), &public_key).unwrap();
        let opened: Value = crypto::decrypt(&envelope, &keys.private_key(&tag).unwrap()).unwrap();
        assert_eq!(opened, json!({ "id": "1" }));
    }

    #[test]
    fn recreating_an_existing_tag_is_rejected() {
        let keys = manager();
        let tag = KeyTag::for_guid("guid-2");
        keys.create_key_pair(&tag).unwrap();
        let before = keys.public_key(&tag).unwrap();

        assert_eq!(keys.create_key_pair(&tag), Err(KeyError::AlreadyExists(tag.to_string())));
        assert_eq!(keys.public_key(&tag).unwrap(), before);
    }

    #[test]
    fn unknown_and_deleted_tags_are_not_found() {
        let keys = manager();
        let tag = KeyTag::for_guid("guid-3");
        assert!(matches!(keys.public_key(&tag), Err(KeyError::TagNotFound(_))));

        keys.create_key_pair(&tag).unwrap();
        keys.delete_key_pair(&tag).unwrap();
        assert!(matches!(keys.private_key(&tag), Err(KeyError::TagNotFound(_))));
        assert!(matches!(keys.delete_key_pair(&tag), Err(KeyError::TagNotFound(_))));
        assert!(!keys.has_key_pair(&tag).unwrap());
    }

    #[test]
    fn corrupt_store_entries_surface_without_key_material() {
        let keys = manager();
        let tag = KeyTag::for_guid("guid-4");
        keys.store().put(&tag, AutoZeroedByteArray::new(vec![0xde, 0xad])).unwrap();

        match keys.private_key(&tag) {
            Err(KeyError::StoreUnavailable(message)) => assert!(!message.contains("dead")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn pem_round_trip_and_signing() {
        let keys = manager();
        let tag = KeyTag::for_guid("guid-5");
        keys.create_key_pair(&tag).unwrap();

        let pem = keys.public_key_pem(&tag).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        let parsed = public_key_from_pem(&pem).unwrap();
        assert_eq!(parsed, keys.public_key(&tag).unwrap());
        assert!(public_key_from_pem("not a key").is_none());

        let signature = keys.sign(&tag, b"message").unwrap();
        assert!(verify_signature(&parsed, b"message", &signature));
    }

    #[test]
    fn concurrent_readers_share_one_key_pair() {
        let keys = Arc::new(manager());
        let tag = KeyTag::for_guid("guid-6");
        keys.create_key_pair(&tag).unwrap();
        let expected = keys.public_key(&tag).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let keys = Arc::clone(&keys);
                let tag = tag.clone();
                std::thread::spawn(move || keys.public_key(&tag).unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
