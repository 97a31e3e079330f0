//! Credential encryption using AES-256-GCM
//!
//! Provider credentials are sealed before they reach the `connections` table. The
//! ciphertext is bound to its connection through additional authenticated data
//! (`organization|provider|account`), so a sealed blob copied onto another row fails to open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::models::connection::Model as ConnectionModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("connection has no stored credential")]
    MissingCredential,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(CryptoKey(bytes))
    }

    /// Random process-lifetime key for local/test profiles without a configured key.
    /// Credentials sealed with it cannot be opened after a restart.
    pub fn ephemeral() -> Self {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        CryptoKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes: `version || nonce || ciphertext+tag`.
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < MIN_ENCRYPTED_LEN || ciphertext[0] != VERSION_ENCRYPTED {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];
    debug_assert!(tag_and_ct.len() >= TAG_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

fn credential_aad(organization_id: Uuid, provider: &str, provider_account_id: &str) -> String {
    format!("{organization_id}|{provider}|{provider_account_id}")
}

/// Seal a provider credential for storage on the given connection identity.
pub fn seal_credential(
    key: &CryptoKey,
    organization_id: Uuid,
    provider: &str,
    provider_account_id: &str,
    credential: &str,
) -> Result<Vec<u8>, CryptoError> {
    let aad = credential_aad(organization_id, provider, provider_account_id);
    encrypt_bytes(key, aad.as_bytes(), credential.as_bytes())
}

/// Open a connection's stored credential. The plaintext is zeroized when dropped.
pub fn open_credential(
    key: &CryptoKey,
    connection: &ConnectionModel,
) -> Result<Zeroizing<String>, CryptoError> {
    let sealed = connection
        .credential_ciphertext
        .as_deref()
        .ok_or(CryptoError::MissingCredential)?;
    let aad = credential_aad(
        connection.organization_id,
        &connection.provider,
        &connection.provider_account_id,
    );
    let bytes = Zeroizing::new(decrypt_bytes(key, aad.as_bytes(), sealed)?);
    String::from_utf8(bytes.to_vec())
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![7u8; 32]).expect("valid test key")
    }

    fn connection_with(ciphertext: Option<Vec<u8>>, org: Uuid) -> ConnectionModel {
        ConnectionModel {
            id: Uuid::new_v4(),
            organization_id: org,
            provider: "shopify".to_string(),
            provider_account_id: "demo.myshopify.com".to_string(),
            credential_ciphertext: ciphertext,
            status: "active".to_string(),
            consecutive_failures: 0,
            last_error: None,
            last_synced_at: None,
            last_cursor: None,
            settings: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[test]
    fn sealed_credential_opens_on_its_own_connection() {
        let key = test_key();
        let org = Uuid::new_v4();
        let sealed =
            seal_credential(&key, org, "shopify", "demo.myshopify.com", "shpat_123").unwrap();
        assert_eq!(sealed[0], VERSION_ENCRYPTED);

        let opened = open_credential(&key, &connection_with(Some(sealed), org)).unwrap();
        assert_eq!(opened.as_str(), "shpat_123");
    }

    #[test]
    fn sealed_credential_is_bound_to_organization() {
        let key = test_key();
        let sealed =
            seal_credential(&key, Uuid::new_v4(), "shopify", "demo.myshopify.com", "t").unwrap();

        let other = connection_with(Some(sealed), Uuid::new_v4());
        assert!(matches!(
            open_credential(&key, &other),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn disconnected_connection_has_no_credential() {
        let key = test_key();
        assert!(matches!(
            open_credential(&key, &connection_with(None, Uuid::new_v4())),
            Err(CryptoError::MissingCredential)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_key();
        let mut encrypted = encrypt_bytes(&key, b"aad", b"secret").unwrap();
        encrypted[13] ^= 0x01;
        assert!(decrypt_bytes(&key, b"aad", &encrypted).is_err());
    }

    #[test]
    fn unversioned_payload_is_rejected() {
        let key = test_key();
        let result = decrypt_bytes(&key, b"aad", b"plaintext-token-without-header");
        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let key = test_key();
        let a = encrypt_bytes(&key, b"aad", b"same").unwrap();
        let b = encrypt_bytes(&key, b"aad", b"same").unwrap();
        assert_ne!(&a[1..13], &b[1..13]);
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert_eq!(CryptoKey::ephemeral().as_bytes().len(), 32);
    }
}
