//! Per-agent keystore, peer trust, and sealed communication (spec §4.12).
//!
//! Grounded on `ccos::secrets::SecretStore`'s layered-resolution shape for
//! the general idea of a per-owner secret container, combined with the
//! X25519/AES-GCM sealing in [`crate::crypto`] and the ratchet state in
//! [`crate::ratchet`]. Unlike `SecretStore`, a `Keychain` never touches
//! disk itself — [`serialization`] is the only boundary that does, and
//! only when the caller asks for it.

pub mod serialization;

use crate::error::{CryptoError, KernelResult};
use crate::ratchet::{RatchetMessage, RatchetSession};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use zeroize::Zeroize;

/// What a keychain knows about a trusted peer. `ratchet_session` starts
/// `None` on [`Keychain::add_peer`] and is populated by
/// [`Keychain::establish_ratchet_as_initiator`] /
/// [`Keychain::establish_ratchet_as_responder`].
pub struct PeerRecord {
    pub signing_public: [u8; 32],
    pub encryption_public: [u8; 32],
    pub trusted_at: DateTime<Utc>,
    pub ratchet_session: Option<RatchetSession>,
}

/// A sealed message produced by [`Keychain::seal_for_peer`]. The
/// `__ratchet__` field name mirrors spec §4.12's wire marker exactly so a
/// peer's `unseal_from_peer` can dispatch on it without guessing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SealedMessage {
    #[serde(rename = "__ratchet__")]
    pub ratchet: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub header: Option<crate::ratchet::RatchetHeader>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[serde(with = "opt_hex32")]
    pub sender_public: Option<[u8; 32]>,
    pub ciphertext: crate::crypto::AeadCiphertext,
}

pub struct Keychain {
    pub agent_id: String,
    signing_public: [u8; 32],
    signing_private: [u8; 64],
    encryption_public: [u8; 32],
    encryption_private: [u8; 32],
    peers: HashMap<String, PeerRecord>,
    channel_keys: HashMap<String, [u8; 32]>,
}

impl std::fmt::Debug for Keychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keychain")
            .field("agent_id", &self.agent_id)
            .field("signing_public", &self.signing_public)
            .field("signing_private", &"<redacted>")
            .field("encryption_public", &self.encryption_public)
            .field("encryption_private", &"<redacted>")
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("channel_keys", &"<redacted>")
            .finish()
    }
}

impl Drop for Keychain {
    fn drop(&mut self) {
        self.signing_private.zeroize();
        self.encryption_private.zeroize();
        for key in self.channel_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl Keychain {
    /// Generate fresh Ed25519 + X25519 keypairs for `agent_id`.
    pub fn new(agent_id: String) -> Self {
        let (signing_public, signing_private) = crate::crypto::generate_signing_keypair();
        let (encryption_public, encryption_private) = crate::crypto::generate_encryption_keypair();
        Self {
            agent_id,
            signing_public,
            signing_private,
            encryption_public,
            encryption_private,
            peers: HashMap::new(),
            channel_keys: HashMap::new(),
        }
    }

    /// Bind a keychain to existing keys (e.g. reconstructed from storage).
    pub fn from_keypairs(
        agent_id: String,
        signing_keypair: ([u8; 32], [u8; 64]),
        encryption_keypair: ([u8; 32], [u8; 32]),
    ) -> Self {
        Self {
            agent_id,
            signing_public: signing_keypair.0,
            signing_private: signing_keypair.1,
            encryption_public: encryption_keypair.0,
            encryption_private: encryption_keypair.1,
            peers: HashMap::new(),
            channel_keys: HashMap::new(),
        }
    }

    pub fn signing_public(&self) -> [u8; 32] {
        self.signing_public
    }

    pub fn encryption_public(&self) -> [u8; 32] {
        self.encryption_public
    }

    pub fn add_peer(&mut self, peer_id: String, signing_public: [u8; 32], encryption_public: [u8; 32]) {
        self.peers.insert(
            peer_id,
            PeerRecord {
                signing_public,
                encryption_public,
                trusted_at: Utc::now(),
                ratchet_session: None,
            },
        );
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn set_channel_key(&mut self, channel_id: String, key: [u8; 32]) {
        self.channel_keys.insert(channel_id, key);
    }

    pub fn channel_key(&self, channel_id: &str) -> Option<&[u8; 32]> {
        self.channel_keys.get(channel_id)
    }

    /// Start a Double Ratchet session as the initiator, using `root_key`
    /// (typically derived from a prior X3DH-style exchange out of band)
    /// and the peer's current encryption public key as its first ratchet
    /// key.
    pub fn establish_ratchet_as_initiator(
        &mut self,
        peer_id: &str,
        root_key: [u8; 32],
    ) -> KernelResult<()> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::InvalidPayload)?;
        peer.ratchet_session = Some(RatchetSession::initiate(root_key, peer.encryption_public));
        Ok(())
    }

    /// Start a Double Ratchet session as the responder, using our own
    /// static encryption keypair as the initial ratchet keypair.
    pub fn establish_ratchet_as_responder(
        &mut self,
        peer_id: &str,
        root_key: [u8; 32],
    ) -> KernelResult<()> {
        let our_public = self.encryption_public;
        let our_private = self.encryption_private;
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::InvalidPayload)?;
        peer.ratchet_session = Some(RatchetSession::respond(root_key, our_public, our_private));
        Ok(())
    }

    /// Seal `plaintext` for `peer_id`: ratchet if a session exists, else a
    /// one-shot ECDH seal with no lasting state change.
    pub fn seal_for_peer(
        &mut self,
        peer_id: &str,
        plaintext: &[u8],
        caller_aad: &[u8],
    ) -> KernelResult<SealedMessage> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::InvalidPayload)?;

        if let Some(session) = peer.ratchet_session.as_mut() {
            let message = session.encrypt(plaintext, caller_aad);
            return Ok(SealedMessage {
                ratchet: true,
                header: Some(message.header),
                sender_public: None,
                ciphertext: message.ciphertext,
            });
        }

        let ciphertext = crate::crypto::seal(plaintext, &peer.encryption_public, &self.encryption_private);
        Ok(SealedMessage {
            ratchet: false,
            header: None,
            sender_public: Some(self.encryption_public),
            ciphertext,
        })
    }

    /// Unseal a message received from `peer_id`, recognizing the
    /// `__ratchet__` marker.
    pub fn unseal_from_peer(&mut self, peer_id: &str, sealed: &SealedMessage) -> KernelResult<Vec<u8>> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CryptoError::InvalidPayload)?;

        if sealed.ratchet {
            let header = sealed
                .header
                .clone()
                .ok_or_else(|| CryptoError::InvalidPayload)?;
            let session = peer
                .ratchet_session
                .as_mut()
                .ok_or_else(|| CryptoError::InvalidPayload)?;
            let message = RatchetMessage {
                header,
                ciphertext: sealed.ciphertext.clone(),
            };
            return Ok(session.decrypt(&message, b"")?);
        }

        let sender_public = sealed.sender_public.unwrap_or(peer.encryption_public);
        Ok(crate::crypto::unseal(&sealed.ciphertext, &sender_public, &self.encryption_private)?)
    }

    pub(crate) fn signing_private(&self) -> [u8; 64] {
        self.signing_private
    }

    pub(crate) fn encryption_private(&self) -> [u8; 32] {
        self.encryption_private
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = (&String, &PeerRecord)> {
        self.peers.iter()
    }

    pub(crate) fn set_peer_ratchet_session(&mut self, peer_id: &str, session: RatchetSession) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.ratchet_session = Some(session);
        }
    }

    pub(crate) fn channel_keys(&self) -> &HashMap<String, [u8; 32]> {
        &self.channel_keys
    }
}

mod opt_hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
                let arr = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}
