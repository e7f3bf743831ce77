// src/vault.rs
//! Credential Vault (C1, spec §4.1).
//!
//! Seals and unseals [`CredentialMaterial`] with AES-256-GCM: a fresh
//! random nonce per call, tampered ciphertext fails authentication before
//! any plaintext is produced. The vault never logs plaintext, and callers
//! are expected to drop/zero the material promptly after use (the
//! `Zeroize` impl on `CredentialMaterial` makes that a `.zeroize()` call
//! away).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroize;

use crate::config::VaultConfig;
use crate::errors::VaultError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Plaintext credential material, disambiguated by content as spec §4.2
/// requires for `SshTransport::open`.
#[derive(Clone, Serialize, Deserialize)]
pub enum CredentialMaterial {
    Password(String),
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
}

impl Zeroize for CredentialMaterial {
    fn zeroize(&mut self) {
        match self {
            CredentialMaterial::Password(s) => s.zeroize(),
            CredentialMaterial::PrivateKey { pem, passphrase } => {
                pem.zeroize();
                if let Some(p) = passphrase {
                    p.zeroize();
                }
            }
        }
    }
}

impl Drop for CredentialMaterial {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// An opaque, authenticated blob: `nonce || ciphertext`. Safe to store or
/// transmit; useless without the vault's key.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SealedCredential(Vec<u8>);

impl SealedCredential {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Flips one byte, for testing tamper detection (spec §8 law 5).
    #[cfg(test)]
    pub fn tamper(&mut self) {
        if let Some(byte) = self.0.last_mut() {
            *byte ^= 0xFF;
        }
    }
}

/// Process-wide authenticated symmetric vault.
pub struct CredentialVault {
    key: [u8; KEY_LEN],
}

impl CredentialVault {
    /// Builds the vault from config, deriving its key from the injected
    /// secret if present, or generating (and warning about) an ephemeral
    /// one otherwise.
    pub fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        let key = match &config.key_hex {
            Some(hex) => decode_hex_key(hex)?,
            None => {
                warn!(
                    "no vault key configured; generating an ephemeral one for this process only \
                     (sealed credentials will not survive a restart)"
                );
                let mut key = [0u8; KEY_LEN];
                rand::thread_rng().fill_bytes(&mut key);
                key
            }
        };
        Ok(CredentialVault { key })
    }

    pub fn seal(&self, material: &CredentialMaterial) -> Result<SealedCredential, VaultError> {
        let plaintext = serde_json::to_vec(material)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| VaultError::Malformed("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(SealedCredential(blob))
    }

    pub fn unseal(&self, sealed: &SealedCredential) -> Result<CredentialMaterial, VaultError> {
        if sealed.0.len() < NONCE_LEN {
            return Err(VaultError::Malformed("blob shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.0.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Integrity)?;

        let material: CredentialMaterial = serde_json::from_slice(&plaintext)?;
        Ok(material)
    }
}

fn decode_hex_key(hex: &str) -> Result<[u8; KEY_LEN], VaultError> {
    let bytes = hex_decode(hex).map_err(|e| VaultError::Malformed(e))?;
    if bytes.len() != KEY_LEN {
        return Err(VaultError::Malformed(format!(
            "vault key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("hex string has odd length".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(&VaultConfig { key_hex: None }).unwrap()
    }

    #[test]
    fn seal_unseal_round_trips() {
        let vault = vault();
        let material = CredentialMaterial::Password("hunter2".to_string());
        let sealed = vault.seal(&material).unwrap();
        let recovered = vault.unseal(&sealed).unwrap();
        match recovered {
            CredentialMaterial::Password(p) => assert_eq!(p, "hunter2"),
            _ => panic!("wrong variant recovered"),
        }
    }

    #[test]
    fn tampered_blob_fails_integrity_check() {
        let vault = vault();
        let material = CredentialMaterial::PrivateKey {
            pem: "-----BEGIN KEY-----".to_string(),
            passphrase: None,
        };
        let mut sealed = vault.seal(&material).unwrap();
        sealed.tamper();
        let result = vault.unseal(&sealed);
        assert!(matches!(result, Err(VaultError::Integrity)));
    }

    #[test]
    fn distinct_seals_use_distinct_nonces() {
        let vault = vault();
        let material = CredentialMaterial::Password("same".to_string());
        let a = vault.seal(&material).unwrap();
        let b = vault.seal(&material).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn configured_key_round_trips() {
        let key_hex = "00".repeat(KEY_LEN);
        let vault = CredentialVault::new(&VaultConfig {
            key_hex: Some(key_hex),
        })
        .unwrap();
        let material = CredentialMaterial::Password("x".to_string());
        let sealed = vault.seal(&material).unwrap();
        assert!(vault.unseal(&sealed).is_ok());
    }
}
