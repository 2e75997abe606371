//! keyhole_vault
//!
//! The Secret Store contract (§4.1) and its reference implementation, an
//! AES-256-GCM-sealed file ("the Vault"). A thin, contract-compatible OS
//! Keychain stub rounds out the trait as an alternative backend — per
//! spec this is a plug-in point, not part of the core; it is not wired to
//! any real platform credential manager here.

use keyhole_common::SensitiveString;
use rand::RngCore;
use scrypt::Params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const SCRYPT_LOG_N: u8 = 14; // N = 16384
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const KEY_LEN: usize = 32;

const WRONG_PASSPHRASE_MSG: &str = "Invalid passphrase or corrupted vault";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("store is locked")]
    Locked,
    #[error("{WRONG_PASSPHRASE_MSG}")]
    WrongPassphrase,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("passphrase required")]
    PassphraseRequired,
    #[error("vault file already exists at {0}")]
    AlreadyExists(PathBuf),
    #[error("malformed vault payload: {0}")]
    Malformed(String),
}

/// Contract every Secret Store backend satisfies (§4.1). Blanket-object
/// safe so the sidecar can hold either backend behind one trait object.
pub trait SecretStore: Send + Sync {
    fn get(&self, reference: &str) -> Result<String, StoreError>;
    fn set(&mut self, reference: &str, value: &str, passphrase: Option<&str>) -> Result<(), StoreError>;
    fn delete(&mut self, reference: &str, passphrase: Option<&str>) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<String>, StoreError>;
    fn has(&self, reference: &str) -> Result<bool, StoreError>;
    fn set_many(
        &mut self,
        entries: &[(String, String)],
        passphrase: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Snapshot every resolved secret value, used to build the Secret
    /// Registry and Request Builder after unlock.
    fn resolve_all(&self) -> Result<BTreeMap<String, String>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultPayload {
    version: u8,
    created_at: String,
    secrets: BTreeMap<String, String>,
}

/// The encrypted, at-rest Secret Store. Holds the full secret map in RAM
/// once unlocked; every mutation re-seals the whole file atomically with a
/// fresh salt and nonce (§4.1, §8 property 8).
pub struct Vault {
    path: PathBuf,
    passphrase: SensitiveString,
    secrets: BTreeMap<String, String>,
    created_at: String,
}

impl Vault {
    /// Create a brand-new, empty vault file. Fails if one already exists.
    pub fn create(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self, StoreError> {
        let path = path.into();
        if path.exists() {
            return Err(StoreError::AlreadyExists(path));
        }
        let created_at = now_rfc3339();
        let mut vault = Vault {
            path,
            passphrase: SensitiveString::new(passphrase),
            secrets: BTreeMap::new(),
            created_at,
        };
        vault.reseal()?;
        Ok(vault)
    }

    /// Open an existing vault file, deriving the key from `passphrase`.
    /// A wrong passphrase and a tampered/corrupted file are
    /// indistinguishable by design (§4.1, §7): both surface
    /// [`StoreError::WrongPassphrase`].
    pub fn unlock(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self, StoreError> {
        let path = path.into();
        let raw = fs::read(&path)?;
        let (salt, nonce, tag, ciphertext) = split_blob(&raw)?;

        let key = derive_key(passphrase.as_bytes(), salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Nonce::from_slice(nonce);

        // aes-gcm expects ciphertext||tag; on disk we store tag before
        // ciphertext (§3 layout), so recombine before calling decrypt.
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        let plaintext = cipher
            .decrypt(nonce, combined.as_ref())
            .map_err(|_| StoreError::WrongPassphrase)?;

        let payload: VaultPayload =
            serde_json::from_slice(&plaintext).map_err(|_| StoreError::WrongPassphrase)?;

        Ok(Vault {
            path,
            passphrase: SensitiveString::new(passphrase),
            secrets: payload.secrets,
            created_at: payload.created_at,
        })
    }

    /// Re-encrypt the full in-RAM map with a fresh salt and nonce and
    /// atomically replace the vault file on disk.
    fn reseal(&mut self) -> Result<(), StoreError> {
        let payload = VaultPayload {
            version: 1,
            created_at: self.created_at.clone(),
            secrets: self.secrets.clone(),
        };
        let plaintext = serde_json::to_vec(&payload)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = derive_key(self.passphrase.expose().as_bytes(), &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Nonce::from_slice(&nonce_bytes);

        let combined = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        let (ciphertext, tag) = combined.split_at(combined.len() - TAG_LEN);

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + TAG_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ciphertext);

        atomic_write(&self.path, &blob)?;
        Ok(())
    }
}

impl SecretStore for Vault {
    fn get(&self, reference: &str) -> Result<String, StoreError> {
        self.secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }

    fn set(&mut self, reference: &str, value: &str, _passphrase: Option<&str>) -> Result<(), StoreError> {
        self.secrets.insert(reference.to_string(), value.to_string());
        self.reseal()
    }

    fn delete(&mut self, reference: &str, _passphrase: Option<&str>) -> Result<(), StoreError> {
        if self.secrets.remove(reference).is_none() {
            return Err(StoreError::NotFound(reference.to_string()));
        }
        self.reseal()
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.secrets.keys().cloned().collect())
    }

    fn has(&self, reference: &str) -> Result<bool, StoreError> {
        Ok(self.secrets.contains_key(reference))
    }

    /// Exactly one atomic write regardless of batch size (§4.1, §8
    /// property 8) — mutate the in-RAM map for every entry, then reseal
    /// once.
    fn set_many(
        &mut self,
        entries: &[(String, String)],
        _passphrase: Option<&str>,
    ) -> Result<(), StoreError> {
        for (reference, value) in entries {
            self.secrets.insert(reference.clone(), value.clone());
        }
        self.reseal()
    }

    fn resolve_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.secrets.clone())
    }
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .expect("static scrypt params are always valid");
    let mut out = [0u8; KEY_LEN];
    scrypt::scrypt(passphrase, salt, &params, &mut out).expect("fixed-size output always fits");
    out
}

fn split_blob(raw: &[u8]) -> Result<(&[u8], &[u8], &[u8], &[u8]), StoreError> {
    let header_len = SALT_LEN + NONCE_LEN + TAG_LEN;
    if raw.len() < header_len {
        return Err(StoreError::WrongPassphrase);
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce, rest) = rest.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);
    Ok((salt, nonce, tag, ciphertext))
}

/// Write `<path>.tmp` with 0600, then rename over `<path>` — either the
/// old or the new valid blob is ever visible on disk (§5).
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = tmp_path_for(path);
    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(bytes)?;
        f.flush()?;
        set_owner_only(&f)?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(unix)]
fn set_owner_only(f: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    f.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_f: &fs::File) -> std::io::Result<()> {
    Ok(())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Contract-compatible stub for an OS keychain backend (`security` /
/// `secret-tool`). Out of core scope (§1): a real implementation shells
/// out to the platform helper and pipes values over stdin, never argv.
/// This stub only demonstrates the trait boundary the sidecar programs
/// against.
pub struct KeychainStore {
    entries: BTreeMap<String, String>,
}

impl KeychainStore {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeychainStore {
    fn get(&self, reference: &str) -> Result<String, StoreError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }

    fn set(&mut self, reference: &str, value: &str, _passphrase: Option<&str>) -> Result<(), StoreError> {
        self.entries.insert(reference.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&mut self, reference: &str, _passphrase: Option<&str>) -> Result<(), StoreError> {
        self.entries
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn has(&self, reference: &str) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(reference))
    }

    fn set_many(
        &mut self,
        entries: &[(String, String)],
        _passphrase: Option<&str>,
    ) -> Result<(), StoreError> {
        for (reference, value) in entries {
            self.entries.insert(reference.clone(), value.clone());
        }
        Ok(())
    }

    fn resolve_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn create_then_unlock_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.bin");

        let mut vault = Vault::create(&path, "passphrase12!").unwrap();
        vault
            .set_many(
                &[
                    ("a".to_string(), "value-a-long-enough".to_string()),
                    ("b".to_string(), "value-b-long-enough".to_string()),
                    ("c".to_string(), "value-c-long-enough".to_string()),
                ],
                None,
            )
            .unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert!(!tmp_path_for(&path).exists());

        let reopened = Vault::unlock(&path, "passphrase12!").unwrap();
        let mut listed = reopened.list().unwrap();
        listed.sort();
        assert_eq!(listed, vec!["a", "b", "c"]);
        assert_eq!(reopened.get("a").unwrap(), "value-a-long-enough");
    }

    #[test]
    fn wrong_passphrase_is_generic_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.bin");
        Vault::create(&path, "correct-horse-battery").unwrap();

        let err = Vault::unlock(&path, "wrong").unwrap_err();
        assert_eq!(err.to_string(), WRONG_PASSPHRASE_MSG);
    }

    #[test]
    fn tampered_file_yields_same_generic_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.bin");
        Vault::create(&path, "correct-horse-battery").unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = Vault::unlock(&path, "correct-horse-battery").unwrap_err();
        assert_eq!(err.to_string(), WRONG_PASSPHRASE_MSG);
    }

    #[test]
    fn create_fails_if_file_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.bin");
        Vault::create(&path, "p").unwrap();
        let err = Vault::create(&path, "p").unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn set_many_is_a_single_atomic_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.bin");
        let mut vault = Vault::create(&path, "p").unwrap();

        let before = fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        vault
            .set_many(
                &[
                    ("x".into(), "value-x-long-enough".into()),
                    ("y".into(), "value-y-long-enough".into()),
                ],
                None,
            )
            .unwrap();
        let after = fs::metadata(&path).unwrap().modified().unwrap();
        assert!(after > before);
        assert!(!tmp_path_for(&path).exists());
    }
}
