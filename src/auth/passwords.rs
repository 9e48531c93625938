//! The password file and its stored-password forms.
//!
//! One record per line, `username:verifier`. The verifier is recognized by
//! prefix: `md5` + 32 hex digits, a SCRAM verifier, `AES` + base64 of an
//! openssl-style encrypted blob (decrypted lazily with the cluster key), a
//! `TEXT ` marker for explicitly plaintext entries, or bare plaintext.

use std::collections::HashMap;

use base64::prelude::{Engine, BASE64_STANDARD};
use openssl::symm::{decrypt, Cipher};
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::messages::constants::{
    AES_PASSWORD_PREFIX, MD5_PASSWORD_PREFIX, SCRAM_VERIFIER_PREFIX, TEXT_PASSWORD_PREFIX,
};

/// One parsed password-file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPassword {
    /// Plaintext, bare or `TEXT `-prefixed.
    Plain(String),
    /// `md5` + hex(md5(password + username)).
    Md5(String),
    /// A full SCRAM verifier record.
    ScramVerifier(String),
    /// Base64 AES-256-CBC ciphertext, decrypted on first use.
    AesEncrypted(String),
}

impl StoredPassword {
    pub fn parse(record: &str) -> StoredPassword {
        if let Some(plain) = record.strip_prefix(TEXT_PASSWORD_PREFIX) {
            StoredPassword::Plain(plain.to_string())
        } else if record.starts_with(SCRAM_VERIFIER_PREFIX) {
            StoredPassword::ScramVerifier(record.to_string())
        } else if record.starts_with(MD5_PASSWORD_PREFIX) && record.len() == 35 {
            StoredPassword::Md5(record.to_string())
        } else if let Some(encrypted) = record.strip_prefix(AES_PASSWORD_PREFIX) {
            StoredPassword::AesEncrypted(encrypted.to_string())
        } else {
            StoredPassword::Plain(record.to_string())
        }
    }
}

/// In-memory view of the password file plus the lazily loaded cluster key.
pub struct PasswordStore {
    entries: HashMap<String, StoredPassword>,
    aes_key_file: Option<String>,
    aes_key: parking_lot::Mutex<Option<Vec<u8>>>,
}

impl PasswordStore {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            aes_key_file: None,
            aes_key: parking_lot::Mutex::new(None),
        }
    }

    pub fn from_contents(contents: &str, aes_key_file: Option<String>) -> Self {
        let mut entries = HashMap::new();
        for line in contents.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((username, record)) = line.split_once(':') {
                entries.insert(username.to_string(), StoredPassword::parse(record));
            }
        }
        Self {
            entries,
            aes_key_file,
            aes_key: parking_lot::Mutex::new(None),
        }
    }

    pub async fn load(path: &str, aes_key_file: Option<String>) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::BadConfig(format!("could not read password file {path}: {err}")))?;
        Ok(Self::from_contents(&contents, aes_key_file))
    }

    pub fn lookup(&self, username: &str) -> Option<&StoredPassword> {
        self.entries.get(username)
    }

    /// Resolve a stored password to the plaintext the backend-facing auth
    /// needs, decrypting AES entries with the cluster key on first use.
    pub fn resolve_plaintext(&self, stored: &StoredPassword) -> Result<String, Error> {
        match stored {
            StoredPassword::Plain(p) => Ok(p.clone()),
            StoredPassword::AesEncrypted(b64) => {
                let key = self.cluster_key()?;
                decrypt_aes_password(b64, &key)
            }
            StoredPassword::Md5(_) | StoredPassword::ScramVerifier(_) => Err(Error::AuthFailure(
                "stored password is hashed and cannot be used against this backend".into(),
            )),
        }
    }

    fn cluster_key(&self) -> Result<Vec<u8>, Error> {
        let mut guard = self.aes_key.lock();
        if let Some(key) = guard.as_ref() {
            return Ok(key.clone());
        }
        let path = self.aes_key_file.as_ref().ok_or_else(|| {
            Error::AuthFailure("AES-encrypted password found but no cluster key file configured".into())
        })?;
        let contents = std::fs::read_to_string(path)
            .map_err(|err| Error::BadConfig(format!("could not read key file {path}: {err}")))?;
        let key = contents.trim_end_matches('\n').as_bytes().to_vec();
        *guard = Some(key.clone());
        Ok(key)
    }
}

/// Decrypt an openssl-enc style blob: `Salted__` + 8-byte salt + ciphertext,
/// key and iv derived from the passphrase by the EVP_BytesToKey scheme over
/// SHA-256.
pub fn decrypt_aes_password(encoded: &str, passphrase: &[u8]) -> Result<String, Error> {
    let blob = BASE64_STANDARD
        .decode(encoded)
        .map_err(|_| Error::AuthFailure("undecodable AES password".into()))?;
    if blob.len() < 16 || &blob[..8] != b"Salted__" {
        return Err(Error::AuthFailure("malformed AES password blob".into()));
    }
    let salt = &blob[8..16];
    let ciphertext = &blob[16..];

    let (key, iv) = derive_key_iv(passphrase, salt);
    let plain = decrypt(Cipher::aes_256_cbc(), &key, Some(&iv), ciphertext)
        .map_err(|_| Error::AuthFailure("AES password decryption failed".into()))?;
    String::from_utf8(plain)
        .map_err(|_| Error::AuthFailure("decrypted password is not valid UTF-8".into()))
}

/// EVP_BytesToKey with SHA-256, one round per block: D_i = H(D_{i-1} ‖ pass
/// ‖ salt), concatenated until 48 bytes cover key (32) + iv (16).
fn derive_key_iv(passphrase: &[u8], salt: &[u8]) -> ([u8; 32], [u8; 16]) {
    let mut material = Vec::with_capacity(64);
    let mut previous: Vec<u8> = Vec::new();
    while material.len() < 48 {
        let mut hasher = Sha256::new();
        hasher.update(&previous);
        hasher.update(passphrase);
        hasher.update(salt);
        previous = hasher.finalize().to_vec();
        material.extend_from_slice(&previous);
    }
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&material[..32]);
    iv.copy_from_slice(&material[32..48]);
    (key, iv)
}
