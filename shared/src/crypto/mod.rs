pub mod keys;

use aes::Aes256;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;

use crate::envelope::{Algorithm, Envelope};
use crate::error::CryptoError;
use crate::primitives::AutoZeroedByteArray;
use crate::utils::{b64_decode, b64_encode};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

fn random_bytes(len: usize) -> AutoZeroedByteArray {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    AutoZeroedByteArray::new(bytes)
}

pub fn aes256_cbc_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn aes256_cbc_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::Unreadable)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::Unreadable)
}

pub fn rsa_wrap(recipient: &RsaPublicKey, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), secret)
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub fn rsa_unwrap(private_key: &RsaPrivateKey, wrapped: &[u8]) -> Result<AutoZeroedByteArray, CryptoError> {
    private_key
        .decrypt_blinded(&mut OsRng, Oaep::new::<Sha256>(), wrapped)
        .map(AutoZeroedByteArray::new)
        .map_err(|_| CryptoError::Unreadable)
}

/// Seals `payload` as JSON for the holder of `recipient`'s private key.
///
/// A fresh AES-256 key and IV are drawn for every call and dropped (zeroed)
/// before returning.
pub fn encrypt<T: Serialize + ?Sized>(payload: &T, recipient: &RsaPublicKey) -> Result<Envelope, CryptoError> {
    let plaintext = serde_json::to_vec(payload).map_err(|_| CryptoError::EncryptionFailed)?;
    let plaintext = AutoZeroedByteArray::new(plaintext);
    encrypt_bytes(plaintext.as_slice(), recipient)
}

pub fn encrypt_bytes(plaintext: &[u8], recipient: &RsaPublicKey) -> Result<Envelope, CryptoError> {
    let key = random_bytes(AES_KEY_LEN);
    let iv = random_bytes(AES_IV_LEN);

    let cipher_data = aes256_cbc_encrypt(plaintext, key.as_slice(), iv.as_slice())?;
    let wrapped_key = rsa_wrap(recipient, key.as_slice())?;
    let wrapped_iv = rsa_wrap(recipient, iv.as_slice())?;

    Ok(Envelope {
        cipher_data: b64_encode(&cipher_data),
        wrapped_key: b64_encode(&wrapped_key),
        wrapped_iv: b64_encode(&wrapped_iv),
        connection_id: None,
        algorithm: Algorithm::Aes256Cbc,
    })
}

/// Opens an envelope and parses the plaintext as `T`.
///
/// Bad base64, a key that does not unwrap, bad padding and a payload of the
/// wrong shape are indistinguishable to the caller.
pub fn decrypt<T: DeserializeOwned>(envelope: &Envelope, private_key: &RsaPrivateKey) -> Result<T, CryptoError> {
    let plaintext = decrypt_bytes(envelope, private_key)?;
    serde_json::from_slice(plaintext.as_slice()).map_err(|_| CryptoError::Unreadable)
}

/// Like [`decrypt`], for callers that only need a JSON object.
pub fn decrypt_json(
    envelope: &Envelope,
    private_key: &RsaPrivateKey,
) -> Result<serde_json::Map<String, serde_json::Value>, CryptoError> {
    decrypt(envelope, private_key)
}

fn decrypt_bytes(envelope: &Envelope, private_key: &RsaPrivateKey) -> Result<AutoZeroedByteArray, CryptoError> {
    let cipher_data = b64_decode(&envelope.cipher_data).ok_or(CryptoError::Unreadable)?;
    let wrapped_key = b64_decode(&envelope.wrapped_key).ok_or(CryptoError::Unreadable)?;
    let wrapped_iv = b64_decode(&envelope.wrapped_iv).ok_or(CryptoError::Unreadable)?;

    let key = rsa_unwrap(private_key, &wrapped_key)?;
    let iv = rsa_unwrap(private_key, &wrapped_iv)?;
    if key.len() != AES_KEY_LEN || iv.len() != AES_IV_LEN {
        return Err(CryptoError::Unreadable);
    }

    aes256_cbc_decrypt(&cipher_data, key.as_slice(), iv.as_slice()).map(AutoZeroedByteArray::new)
}

/// RSA PKCS#1 v1.5 / SHA-256 signature.
pub fn sign(private_key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    signing_key
        .try_sign_with_rng(&mut OsRng, message)
        .map(|signature| signature.to_vec())
        .map_err(|_| CryptoError::SigningFailed)
}

pub fn verify_signature(public_key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    match Signature::try_from(signature) {
        Ok(signature) => verifying_key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aes256GcmEncryptedData {
    pub ciphertext: String,
    pub iv: String,
}

/// AES-256-GCM sealing for data at rest, bound to `additional_data`.
pub fn aes256_gcm_encrypt(
    plaintext: &[u8],
    key: &[u8],
    additional_data: &[u8],
) -> Result<Aes256GcmEncryptedData, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let payload = Payload {
        msg: plaintext,
        aad: additional_data,
    };

    let ciphertext = cipher
        .encrypt(&nonce, payload)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Aes256GcmEncryptedData {
        ciphertext: b64_encode(&ciphertext),
        iv: b64_encode(&nonce),
    })
}

pub fn aes256_gcm_decrypt(
    sealed: &Aes256GcmEncryptedData,
    key: &[u8],
    additional_data: &[u8],
) -> Result<AutoZeroedByteArray, CryptoError> {
    let ciphertext = b64_decode(&sealed.ciphertext).ok_or(CryptoError::Unreadable)?;
    let nonce = b64_decode(&sealed.iv).ok_or(CryptoError::Unreadable)?;
    if nonce.len() != GCM_NONCE_LEN {
        return Err(CryptoError::Unreadable);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Unreadable)?;
    let payload = Payload {
        msg: &ciphertext,
        aad: additional_data,
    };

    cipher
        .decrypt(Nonce::from_slice(&nonce), payload)
        .map(AutoZeroedByteArray::new)
        .map_err(|_| CryptoError::Unreadable)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    /// One 1024-bit key shared by the crypto tests.
    pub fn private_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap())
    }

    pub fn other_private_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::{other_private_key, private_key};
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    #[derive(Debug, PartialEq, Deserialize)]
    struct Shaped {
        id: String,
        title: String,
    }

    fn public_key() -> RsaPublicKey {
        RsaPublicKey::from(private_key())
    }

    fn flip_byte(encoded: &str, index: usize) -> String {
        let mut bytes = b64_decode(encoded).unwrap();
        let index = index % bytes.len();
        bytes[index] ^= 0x01;
        b64_encode(&bytes)
    }

    #[test]
    fn round_trip() {
        let payload = json!({ "id": "00000", "title": "Authorization" });
        let envelope = encrypt(&payload, &public_key()).unwrap();
        let decrypted: Value = decrypt(&envelope, private_key()).unwrap();
        assert_eq!(decrypted, payload);
        assert_eq!(envelope.algorithm, Algorithm::Aes256Cbc);
    }

    #[test]
    fn every_envelope_uses_fresh_key_material() {
        let payload = json!({ "id": "00000", "title": "Authorization" });
        let first = encrypt(&payload, &public_key()).unwrap();
        let second = encrypt(&payload, &public_key()).unwrap();
        assert_ne!(first.cipher_data, second.cipher_data);
        assert_ne!(first.wrapped_key, second.wrapped_key);
        assert_ne!(first.wrapped_iv, second.wrapped_iv);
    }

    #[test]
    fn tampering_with_any_field_is_rejected() {
        let payload = json!({ "id": "00000", "title": "Authorization", "description": "x".repeat(80) });
        let envelope = encrypt(&payload, &public_key()).unwrap();

        for index in [0usize, 7, 16, 31, 47, usize::MAX] {
            let mut tampered = envelope.clone();
            tampered.cipher_data = flip_byte(&envelope.cipher_data, index);
            assert_eq!(decrypt::<Shaped>(&tampered, private_key()), Err(CryptoError::Unreadable));

            let mut tampered = envelope.clone();
            tampered.wrapped_key = flip_byte(&envelope.wrapped_key, index);
            assert_eq!(decrypt::<Shaped>(&tampered, private_key()), Err(CryptoError::Unreadable));

            let mut tampered = envelope.clone();
            tampered.wrapped_iv = flip_byte(&envelope.wrapped_iv, index);
            assert_eq!(decrypt::<Shaped>(&tampered, private_key()), Err(CryptoError::Unreadable));
        }
    }

    #[test]
    fn wrong_private_key_is_unreadable() {
        let envelope = encrypt(&json!({ "id": "1", "title": "t" }), &public_key()).unwrap();
        assert_eq!(decrypt::<Shaped>(&envelope, other_private_key()), Err(CryptoError::Unreadable));
    }

    #[test]
    fn malformed_fields_are_typed_failures() {
        let envelope = encrypt(&json!({ "id": "1", "title": "t" }), &public_key()).unwrap();

        let mut bad = envelope.clone();
        bad.cipher_data = "%%% not base64 %%%".to_string();
        assert_eq!(decrypt::<Value>(&bad, private_key()), Err(CryptoError::Unreadable));

        let mut bad = envelope.clone();
        bad.cipher_data = b64_encode(b"short");
        assert_eq!(decrypt::<Value>(&bad, private_key()), Err(CryptoError::Unreadable));

        let mut bad = envelope.clone();
        bad.wrapped_key = String::new();
        assert_eq!(decrypt::<Value>(&bad, private_key()), Err(CryptoError::Unreadable));
    }

    #[test]
    fn wrong_shape_is_unreadable() {
        let envelope = encrypt(&json!({ "unexpected": true }), &public_key()).unwrap();
        assert_eq!(decrypt::<Shaped>(&envelope, private_key()), Err(CryptoError::Unreadable));

        let envelope = encrypt(&json!(["not", "an", "object"]), &public_key()).unwrap();
        assert!(decrypt_json(&envelope, private_key()).is_err());
    }

    #[test]
    fn signatures_verify_only_for_the_signed_message() {
        let signature = sign(private_key(), b"delete|https://p.test|1700000000|").unwrap();
        assert!(verify_signature(&public_key(), b"delete|https://p.test|1700000000|", &signature));
        assert!(!verify_signature(&public_key(), b"delete|https://p.test|1700000001|", &signature));
        assert!(!verify_signature(
            &RsaPublicKey::from(other_private_key()),
            b"delete|https://p.test|1700000000|",
            &signature
        ));
        assert!(!verify_signature(&public_key(), b"anything", b"garbage"));
    }

    #[test]
    fn gcm_sealing_is_bound_to_key_and_context() {
        let key = [7u8; 32];
        let sealed = aes256_gcm_encrypt(b"private key bytes", &key, b"tag").unwrap();
        let opened = aes256_gcm_decrypt(&sealed, &key, b"tag").unwrap();
        assert_eq!(opened.as_slice(), b"private key bytes");

        assert_eq!(aes256_gcm_decrypt(&sealed, &key, b"other").unwrap_err(), CryptoError::Unreadable);
        assert_eq!(aes256_gcm_decrypt(&sealed, &[8u8; 32], b"tag").unwrap_err(), CryptoError::Unreadable);
        assert_eq!(aes256_gcm_encrypt(b"x", &[0u8; 16], b"").unwrap_err(), CryptoError::EncryptionFailed);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn any_payload_round_trips(title in ".{0,200}", amount in any::<i64>(), flags in prop::collection::vec(any::<bool>(), 0..8)) {
            let payload = json!({ "title": title, "amount": amount, "flags": flags });
            let envelope = encrypt(&payload, &public_key()).unwrap();
            let decrypted: Value = decrypt(&envelope, private_key()).unwrap();
            prop_assert_eq!(decrypted, payload);
        }
    }
}
