//! Keychain serialization and escrow (spec §4.12's `serialize`/`deserialize`/
//! `create_escrow`/`recover_from_escrow`).
//!
//! Grounded on `ccos::secrets::SecretStore::save()`'s envelope shape
//! (versioned record, secret material only ever at rest as ciphertext);
//! the double-wrap in [`create_escrow`] is this module's own addition,
//! since no teacher file layers two independent encryption keys.

use super::Keychain;
use crate::crypto::AeadCiphertext;
use crate::error::CryptoError;
use crate::ratchet::RatchetSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PeerPublic {
    peer_id: String,
    #[serde(with = "hex32")]
    signing_public: [u8; 32],
    #[serde(with = "hex32")]
    encryption_public: [u8; 32],
    trusted_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct PublicProjection {
    agent_id: String,
    #[serde(with = "hex32")]
    signing_public: [u8; 32],
    #[serde(with = "hex32")]
    encryption_public: [u8; 32],
    peers: Vec<PeerPublic>,
}

/// Everything in a [`Keychain`] that must never touch disk unencrypted.
#[derive(Serialize, Deserialize)]
struct PrivateData {
    #[serde(with = "hex64")]
    signing_private: [u8; 64],
    #[serde(with = "hex32")]
    encryption_private: [u8; 32],
    /// Only peers with an established ratchet session carry an entry,
    /// kept as opaque JSON rather than an owned `RatchetSession` since the
    /// keychain only hands out borrowed peer records.
    ratchet_sessions: HashMap<String, serde_json::Value>,
    #[serde(with = "hex32_map")]
    channel_keys: HashMap<String, [u8; 32]>,
}

/// `{version, public, private_encrypted}` — the `private_encrypted` field
/// carries `(ct, iv, tag)` together via [`AeadCiphertext`].
#[derive(Serialize, Deserialize)]
pub struct SerializedKeychain {
    pub version: u32,
    public: PublicProjection,
    private_encrypted: AeadCiphertext,
}

/// An escrow-wrapped [`SerializedKeychain`]: a second independent
/// AES-256-GCM layer sealed under an escrow key, so recovering the
/// keychain requires both the original encryption key and the escrow key.
#[derive(Serialize, Deserialize)]
pub struct EscrowedKeychain {
    pub version: u32,
    sealed: AeadCiphertext,
}

pub fn serialize(keychain: &Keychain, enc_key: &[u8; 32]) -> SerializedKeychain {
    let public = PublicProjection {
        agent_id: keychain.agent_id.clone(),
        signing_public: keychain.signing_public(),
        encryption_public: keychain.encryption_public(),
        peers: keychain
            .peers_iter()
            .map(|(peer_id, peer)| PeerPublic {
                peer_id: peer_id.clone(),
                signing_public: peer.signing_public,
                encryption_public: peer.encryption_public,
                trusted_at: peer.trusted_at,
            })
            .collect(),
    };

    let ratchet_sessions = keychain
        .peers_iter()
        .filter_map(|(peer_id, peer)| {
            peer.ratchet_session
                .as_ref()
                .map(|session| (peer_id.clone(), serde_json::to_value(session).expect("RatchetSession always serializes")))
        })
        .collect();
    let private = PrivateData {
        signing_private: keychain.signing_private(),
        encryption_private: keychain.encryption_private(),
        ratchet_sessions,
        channel_keys: keychain.channel_keys().clone(),
    };
    let private_bytes = serde_json::to_vec(&private).expect("PrivateData always serializes");
    let private_encrypted = crate::crypto::encrypt(&private_bytes, enc_key, None);

    SerializedKeychain {
        version: VERSION,
        public,
        private_encrypted,
    }
}

pub fn deserialize(serialized: &SerializedKeychain, enc_key: &[u8; 32]) -> Result<Keychain, CryptoError> {
    if serialized.version != VERSION {
        return Err(CryptoError::UnsupportedVersion(serialized.version));
    }
    let private_bytes = crate::crypto::decrypt(&serialized.private_encrypted, enc_key, None)
        .map_err(|_| CryptoError::InvalidEncryptionKey)?;
    let private: PrivateData =
        serde_json::from_slice(&private_bytes).map_err(|_| CryptoError::InvalidPayload)?;

    let mut keychain = Keychain::from_keypairs(
        serialized.public.agent_id.clone(),
        (serialized.public.signing_public, private.signing_private),
        (serialized.public.encryption_public, private.encryption_private),
    );
    for peer in &serialized.public.peers {
        keychain.add_peer(peer.peer_id.clone(), peer.signing_public, peer.encryption_public);
    }
    for (peer_id, value) in private.ratchet_sessions {
        let session: RatchetSession =
            serde_json::from_value(value).map_err(|_| CryptoError::InvalidPayload)?;
        keychain.set_peer_ratchet_session(&peer_id, session);
    }
    for (channel_id, key) in private.channel_keys {
        keychain.set_channel_key(channel_id, key);
    }
    Ok(keychain)
}

pub fn create_escrow(keychain: &Keychain, enc_key: &[u8; 32], escrow_key: &[u8; 32]) -> EscrowedKeychain {
    let inner = serialize(keychain, enc_key);
    let inner_bytes = serde_json::to_vec(&inner).expect("SerializedKeychain always serializes");
    let sealed = crate::crypto::encrypt(&inner_bytes, escrow_key, None);
    EscrowedKeychain { version: VERSION, sealed }
}

pub fn recover_from_escrow(
    escrowed: &EscrowedKeychain,
    escrow_key: &[u8; 32],
    enc_key: &[u8; 32],
) -> Result<Keychain, CryptoError> {
    if escrowed.version != VERSION {
        return Err(CryptoError::UnsupportedVersion(escrowed.version));
    }
    let inner_bytes = crate::crypto::decrypt(&escrowed.sealed, escrow_key, None)?;
    let inner: SerializedKeychain =
        serde_json::from_slice(&inner_bytes).map_err(|_| CryptoError::InvalidPayload)?;
    deserialize(&inner, enc_key)
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

mod hex64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

mod hex32_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(map: &HashMap<String, [u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        let as_hex: HashMap<&String, String> = map.iter().map(|(k, v)| (k, hex::encode(v))).collect();
        as_hex.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<HashMap<String, [u8; 32]>, D::Error> {
        let as_hex: HashMap<String, String> = HashMap::deserialize(d)?;
        let mut out = HashMap::with_capacity(as_hex.len());
        for (k, v) in as_hex {
            let bytes = hex::decode(v).map_err(serde::de::Error::custom)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
            out.insert(k, arr);
        }
        Ok(out)
    }
}
