//! Password-based wrapping of the vault master key.
//!
//! The credentials record never stores the password-derived key. It stores a
//! salt, a verification hash `sha256(sha256(password ++ salt))` and the master
//! key encrypted under `sha256(password ++ salt)`.

use crate::atomic::write_atomically;
use crate::cipher::{random_key, CipherMethod, VaultCipher, KEY_SIZE};
use crate::error::IoContext;
use crate::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Method tag written by this version
pub const METHOD_XCHACHA_SHA256_SALT16: &str = "xchacha20poly1305/sha256/salt16";

const SALT_SIZE: usize = 16;

/// The symmetric key protecting every record of a vault.
///
/// Zeroized on drop; `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        Self(random_key())
    }

    /// Accepts exactly [`KEY_SIZE`] bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| Error::InvalidKey {
            reason: format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()),
        })?;
        Ok(Self(array))
    }

    /// Parse a 64 digit hex string, surrounding whitespace ignored
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(hex::decode(text.trim()).map_err(|e| Error::InvalidKey {
            reason: format!("not a hex string: {}", e),
        })?);
        Self::from_slice(&bytes)
    }

    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").field("key", &"[REDACTED]").finish()
    }
}

/// A subordinate account sharing the vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultAccount {
    pub user: String,
    #[serde(rename = "pwhash", with = "base64_bytes")]
    pub password_hash: Vec<u8>,
    pub method: String,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(rename = "enckey", with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(rename = "write")]
    pub write_access: bool,
}

/// Persisted credentials of a vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultCredentials {
    pub user: String,
    #[serde(rename = "pwhash", with = "base64_bytes")]
    pub password_hash: Vec<u8>,
    pub method: String,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(rename = "enckey", with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    pub fingerprint: String,
    #[serde(default)]
    pub accounts: Vec<VaultAccount>,
}

fn first_stage_hash(password: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    Zeroizing::new(hasher.finalize().into())
}

fn verification_hash(first_stage: &[u8]) -> [u8; 32] {
    Sha256::digest(first_stage).into()
}

fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Wrap `key` under a fresh salt. Returns (salt, verification hash, wrapped key).
fn wrap_key(key: &MasterKey, password: &str, cipher: &dyn VaultCipher) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let salt = random_salt();
    let first_stage = first_stage_hash(password, &salt);
    let verification = verification_hash(&first_stage[..]).to_vec();
    let wrapped = cipher.encrypt(key.as_bytes(), CipherMethod::Flat, &first_stage[..])?;
    Ok((salt, verification, wrapped))
}

/// Create credentials around a freshly generated master key
pub fn make_credentials(
    user: &str,
    password: &str,
    fingerprint: &str,
    cipher: &dyn VaultCipher,
) -> Result<VaultCredentials> {
    let key = MasterKey::generate();
    let (salt, password_hash, encrypted_key) = wrap_key(&key, password, cipher)?;

    Ok(VaultCredentials {
        user: user.to_string(),
        password_hash,
        method: METHOD_XCHACHA_SHA256_SALT16.to_string(),
        salt,
        encrypted_key,
        fingerprint: fingerprint.to_string(),
        accounts: Vec::new(),
    })
}

/// Constant-time password check. Unknown methods never match.
pub fn check_password(password: &str, method: &str, stored_hash: &[u8], salt: &[u8]) -> bool {
    if method != METHOD_XCHACHA_SHA256_SALT16 {
        return false;
    }
    let first_stage = first_stage_hash(password, salt);
    let candidate = verification_hash(&first_stage[..]);
    candidate[..].ct_eq(stored_hash).into()
}

/// Verify `password` and unwrap the master key
pub fn decrypt_key(
    password: &str,
    method: &str,
    stored_hash: &[u8],
    salt: &[u8],
    encrypted_key: &[u8],
    cipher: &dyn VaultCipher,
) -> Result<MasterKey> {
    if method != METHOD_XCHACHA_SHA256_SALT16 {
        return Err(Error::UnknownMethod {
            method: method.to_string(),
        });
    }
    if !check_password(password, method, stored_hash, salt) {
        return Err(Error::InvalidCredentials);
    }

    let first_stage = first_stage_hash(password, salt);
    let raw = Zeroizing::new(cipher.decrypt(encrypted_key, &first_stage[..])?);
    MasterKey::from_slice(&raw)
}

impl VaultCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                Error::Filesystem {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            Error::invalid_format(format!("credentials {}: {}", path.display(), e))
        })
    }

    /// Write to `path` through `temp` so readers never see a partial record
    pub fn save_atomically(&self, path: &Path, temp: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomically(temp, path, |scratch| {
            let mut file = File::create(scratch).at(scratch)?;
            file.write_all(&json).at(scratch)?;
            file.sync_all().at(scratch)
        })?;
        debug!("Saved credentials to {}", path.display());
        Ok(())
    }

    pub fn check_password(&self, password: &str) -> bool {
        check_password(password, &self.method, &self.password_hash, &self.salt)
    }

    /// Unwrap the root user's master key
    pub fn decrypt_key(&self, password: &str, cipher: &dyn VaultCipher) -> Result<MasterKey> {
        decrypt_key(
            password,
            &self.method,
            &self.password_hash,
            &self.salt,
            &self.encrypted_key,
            cipher,
        )
    }

    /// Rewrap `key` for the root user under `password` with a fresh salt.
    ///
    /// Every subordinate account is removed and cannot be restored: their
    /// wrappings may not match the recovered key. The key itself is not
    /// checked here; callers must have validated it against vault records.
    pub fn recover_key(&mut self, key: &MasterKey, password: &str, cipher: &dyn VaultCipher) -> Result<()> {
        let (salt, password_hash, encrypted_key) = wrap_key(key, password, cipher)?;
        self.method = METHOD_XCHACHA_SHA256_SALT16.to_string();
        self.salt = salt;
        self.password_hash = password_hash;
        self.encrypted_key = encrypted_key;
        self.accounts.clear();
        Ok(())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
