//! On-disk envelope encryption for agent signing keys (spec §4.1 design
//! notes, §6 `master_key_path`, §9).
//!
//! Grounded on `ccos::secrets::SecretStore::save()`'s "write then chmod
//! 0600" pattern and on `src/keychain/serialization.rs`'s versioned
//! envelope shape, applied here to a single [`Identity`] at a time instead
//! of a whole keychain.

use crate::crypto::AeadCiphertext;
use crate::error::CryptoError;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const VERSION: u32 = 1;

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// `{version, agent_id, public_key, private_encrypted}` for one identity's
/// private key material at rest.
#[derive(Serialize, Deserialize)]
struct SealedIdentityRecord {
    version: u32,
    agent_id: String,
    #[serde(with = "hex32")]
    public_key: [u8; 32],
    private_encrypted: AeadCiphertext,
}

/// Loads or generates a 32-byte master key on first use, then envelope-
/// encrypts and persists agent signing keys under it. Every file this
/// store writes — the master key itself and each identity record — is
/// chmod'd 0600 immediately after creation, matching `SecretStore::save()`.
pub struct SigningKeyStore {
    master_key_path: PathBuf,
    records_dir: PathBuf,
}

impl SigningKeyStore {
    /// `master_key_path` is `KernelConfig::master_key_path`; per-agent
    /// records live in a sibling `keys/` directory.
    pub fn new(master_key_path: impl Into<PathBuf>) -> Self {
        let master_key_path = master_key_path.into();
        let records_dir = master_key_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("keys");
        Self {
            master_key_path,
            records_dir,
        }
    }

    /// The master key, generating and persisting a fresh one on first call
    /// if the file does not yet exist. Tolerates both a raw 32-byte file
    /// and a hex-encoded one, for operator-provisioned keys.
    pub fn master_key(&self) -> Result<[u8; 32], CryptoError> {
        if self.master_key_path.exists() {
            let bytes = fs::read(&self.master_key_path).map_err(|_| CryptoError::InvalidPayload)?;
            if bytes.len() == 32 {
                return bytes.try_into().map_err(|_| CryptoError::InvalidPayload);
            }
            let text = std::str::from_utf8(&bytes).map_err(|_| CryptoError::InvalidPayload)?;
            let decoded = hex::decode(text.trim()).map_err(|_| CryptoError::InvalidPayload)?;
            return decoded.try_into().map_err(|_| CryptoError::InvalidPayload);
        }

        let mut key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
        if let Some(parent) = self.master_key_path.parent() {
            fs::create_dir_all(parent).map_err(|_| CryptoError::InvalidPayload)?;
        }
        fs::write(&self.master_key_path, key).map_err(|_| CryptoError::InvalidPayload)?;
        restrict_to_owner(&self.master_key_path).map_err(|_| CryptoError::InvalidPayload)?;
        Ok(key)
    }

    fn record_path(&self, agent_id: &str) -> PathBuf {
        self.records_dir.join(format!("{agent_id}.json"))
    }

    /// Envelope-encrypt `identity`'s private key under the master key and
    /// write it to its own file. Identities with no private key (the
    /// registry's public-only projection) have nothing to seal and are
    /// rejected rather than silently no-op'd.
    pub fn save(&self, identity: &Identity) -> Result<(), CryptoError> {
        let private_key = identity.private_key.ok_or(CryptoError::InvalidPayload)?;
        let master_key = self.master_key()?;
        let private_encrypted = crate::crypto::encrypt(&private_key, &master_key, Some(identity.agent_id.as_bytes()));

        let record = SealedIdentityRecord {
            version: VERSION,
            agent_id: identity.agent_id.clone(),
            public_key: identity.public_key,
            private_encrypted,
        };
        let bytes = serde_json::to_vec(&record).map_err(|_| CryptoError::InvalidPayload)?;

        fs::create_dir_all(&self.records_dir).map_err(|_| CryptoError::InvalidPayload)?;
        let path = self.record_path(&identity.agent_id);
        fs::write(&path, bytes).map_err(|_| CryptoError::InvalidPayload)?;
        restrict_to_owner(&path).map_err(|_| CryptoError::InvalidPayload)?;
        Ok(())
    }

    /// Reload a previously saved identity, private key intact.
    pub fn load(&self, agent_id: &str) -> Result<Identity, CryptoError> {
        let path = self.record_path(agent_id);
        let bytes = fs::read(&path).map_err(|_| CryptoError::InvalidPayload)?;
        let record: SealedIdentityRecord = serde_json::from_slice(&bytes).map_err(|_| CryptoError::InvalidPayload)?;
        if record.version != VERSION {
            return Err(CryptoError::UnsupportedVersion(record.version));
        }

        let master_key = self.master_key()?;
        let private_bytes = crate::crypto::decrypt(
            &record.private_encrypted,
            &master_key,
            Some(record.agent_id.as_bytes()),
        )?;
        let private_key: [u8; 64] = private_bytes.try_into().map_err(|_| CryptoError::InvalidPayload)?;

        Ok(Identity {
            agent_id: record.agent_id,
            public_key: record.public_key,
            private_key: Some(private_key),
            created_at: chrono::Utc::now(),
            metadata: Default::default(),
        })
    }

    /// Remove a saved identity's key record. Missing files are not an
    /// error; deletion is idempotent.
    pub fn delete(&self, agent_id: &str) -> Result<(), CryptoError> {
        let path = self.record_path(agent_id);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(CryptoError::InvalidPayload),
        }
    }
}

mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = SigningKeyStore::new(dir.path().join("master.key"));
        let identity = Identity::generate();

        store.save(&identity).unwrap();
        let loaded = store.load(&identity.agent_id).unwrap();

        assert_eq!(loaded.agent_id, identity.agent_id);
        assert_eq!(loaded.public_key, identity.public_key);
        assert_eq!(loaded.private_key, identity.private_key);
    }

    #[test]
    fn master_key_is_stable_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");
        let first = SigningKeyStore::new(path.clone()).master_key().unwrap();
        let second = SigningKeyStore::new(path).master_key().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_identity_with_no_private_key() {
        let dir = tempdir().unwrap();
        let store = SigningKeyStore::new(dir.path().join("master.key"));
        let public_only = Identity::generate().public_only();
        assert_eq!(store.save(&public_only), Err(CryptoError::InvalidPayload));
    }

    #[test]
    fn load_rejects_tampered_record() {
        let dir = tempdir().unwrap();
        let store = SigningKeyStore::new(dir.path().join("master.key"));
        let identity = Identity::generate();
        store.save(&identity).unwrap();

        let path = store.record_path(&identity.agent_id);
        let mut record: SealedIdentityRecord = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        record.private_encrypted.tag[0] ^= 0xFF;
        fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(store.load(&identity.agent_id).is_err());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = SigningKeyStore::new(dir.path().join("master.key"));
        let identity = Identity::generate();
        store.save(&identity).unwrap();

        store.delete(&identity.agent_id).unwrap();
        assert!(store.load(&identity.agent_id).is_err());
        store.delete(&identity.agent_id).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = SigningKeyStore::new(dir.path().join("master.key"));
        let identity = Identity::generate();
        store.save(&identity).unwrap();

        let master_mode = fs::metadata(&store.master_key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(master_mode, 0o600);

        let record_mode = fs::metadata(store.record_path(&identity.agent_id))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(record_mode, 0o600);
    }
}
