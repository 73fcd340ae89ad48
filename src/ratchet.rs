//! Double Ratchet channel layer, two-party only (spec §4.13).
//!
//! Grounded directly on the Signal-style ratchet in
//! `other_examples/…darklock-guard…ratchet.rs.rs` (`RatchetSession` shape,
//! `kdf_rk`/`kdf_ck`, skipped-key bounding, DH-ratchet-on-new-header-key
//! control flow). Adapted: AES-256-GCM via [`crate::crypto::aead`] instead
//! of XChaCha20-Poly1305, HKDF info strings and the extra message-key
//! derivation step per this kernel's wire format, header fields kept as
//! raw `[u8; 32]`/`u32` rather than base64 strings, and hex (matching the
//! rest of this crate's serde convention, see
//! [`crate::capability::model`]) instead of base64 for on-the-wire keys.

use crate::crypto::{decrypt as aead_decrypt, derive_key, derive_shared_secret, encrypt as aead_encrypt, AeadCiphertext};
use crate::error::RatchetError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::Zeroize;

/// Size of a root/chain/message key in bytes.
const KEY_LEN: usize = 32;

/// Bound on stored skipped message keys, per spec §4.13's invariant.
pub const DEFAULT_MAX_SKIP: u32 = 100;

/// Sent alongside every ciphertext so the recipient can advance its ratchet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetHeader {
    #[serde(with = "hex32")]
    pub dh_public: [u8; 32],
    pub n: u32,
    pub pn: u32,
}

impl RatchetHeader {
    fn aad(&self, caller_aad: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 4 + 4 + caller_aad.len());
        out.extend_from_slice(&self.dh_public);
        out.extend_from_slice(&self.n.to_be_bytes());
        out.extend_from_slice(&self.pn.to_be_bytes());
        out.extend_from_slice(caller_aad);
        out
    }
}

/// A message ready to go over the wire: header plus AEAD ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub header: RatchetHeader,
    pub ciphertext: AeadCiphertext,
}

/// Per-peer Double Ratchet state. Lives inside a [`crate::keychain::Keychain`]
/// and is sealed to disk along with it; never serialized on its own.
#[derive(Serialize, Deserialize)]
pub struct RatchetSession {
    root_key: [u8; KEY_LEN],

    dh_send_secret: [u8; KEY_LEN],
    #[serde(with = "hex32")]
    dh_send_public: [u8; KEY_LEN],
    send_chain_key: [u8; KEY_LEN],
    send_n: u32,
    prev_send_n: u32,

    #[serde(with = "opt_hex32")]
    dh_remote: Option<[u8; KEY_LEN]>,
    recv_chain_key: [u8; KEY_LEN],
    recv_n: u32,

    #[serde(with = "skipped_keys_serde")]
    skipped_keys: HashMap<([u8; KEY_LEN], u32), [u8; KEY_LEN]>,

    max_skip: u32,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_chain_key.zeroize();
        self.recv_chain_key.zeroize();
        for key in self.skipped_keys.values_mut() {
            key.zeroize();
        }
    }
}

impl RatchetSession {
    /// Start a session as the initiator, having already agreed `root_key`
    /// out of band (e.g. via [`crate::crypto::derive_shared_secret`]) and
    /// learned the peer's current ratchet public key.
    pub fn initiate(root_key: [u8; KEY_LEN], peer_ratchet_public: [u8; KEY_LEN]) -> Self {
        let (dh_send_public, dh_send_secret) = crate::crypto::generate_encryption_keypair();
        let dh_output = derive_shared_secret(&dh_send_secret, &peer_ratchet_public);
        let (new_root, send_chain_key) = kdf_root(&root_key, &dh_output);
        Self {
            root_key: new_root,
            dh_send_secret,
            dh_send_public,
            send_chain_key,
            send_n: 0,
            prev_send_n: 0,
            dh_remote: Some(peer_ratchet_public),
            recv_chain_key: [0u8; KEY_LEN],
            recv_n: 0,
            skipped_keys: HashMap::new(),
            max_skip: DEFAULT_MAX_SKIP,
        }
    }

    /// Start a session as the responder: our own ratchet keypair doubles as
    /// the initial DH key, and the receive chain is established lazily on
    /// the initiator's first message.
    pub fn respond(
        root_key: [u8; KEY_LEN],
        our_ratchet_public: [u8; KEY_LEN],
        our_ratchet_secret: [u8; KEY_LEN],
    ) -> Self {
        Self {
            root_key,
            dh_send_secret: our_ratchet_secret,
            dh_send_public: our_ratchet_public,
            send_chain_key: [0u8; KEY_LEN],
            send_n: 0,
            prev_send_n: 0,
            dh_remote: None,
            recv_chain_key: [0u8; KEY_LEN],
            recv_n: 0,
            skipped_keys: HashMap::new(),
            max_skip: DEFAULT_MAX_SKIP,
        }
    }

    pub fn with_max_skip(mut self, max_skip: u32) -> Self {
        self.max_skip = max_skip;
        self
    }

    pub fn our_ratchet_public(&self) -> [u8; KEY_LEN] {
        self.dh_send_public
    }

    /// Encrypt `plaintext`, advancing the sending chain by one message.
    pub fn encrypt(&mut self, plaintext: &[u8], caller_aad: &[u8]) -> RatchetMessage {
        let (new_chain_key, message_key) = kdf_chain(&self.send_chain_key);
        self.send_chain_key = new_chain_key;

        let header = RatchetHeader {
            dh_public: self.dh_send_public,
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;

        let enc_key = message_encryption_key(&message_key);
        let aad = header.aad(caller_aad);
        let ciphertext = aead_encrypt(plaintext, &enc_key, Some(&aad));
        RatchetMessage { header, ciphertext }
    }

    /// Decrypt a received message, performing a DH ratchet step first if
    /// `header.dh_public` is new.
    pub fn decrypt(
        &mut self,
        message: &RatchetMessage,
        caller_aad: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let header = &message.header;

        if let Some(message_key) = self
            .skipped_keys
            .remove(&(header.dh_public, header.n))
        {
            return self.open(header, &message_key, caller_aad, &message.ciphertext);
        }

        if self.dh_remote != Some(header.dh_public) {
            self.dh_ratchet(header)?;
        }

        self.skip_receive_keys(header.n)?;

        let (new_chain_key, message_key) = kdf_chain(&self.recv_chain_key);
        self.recv_chain_key = new_chain_key;
        self.recv_n += 1;

        self.open(header, &message_key, caller_aad, &message.ciphertext)
    }

    fn open(
        &self,
        header: &RatchetHeader,
        message_key: &[u8; KEY_LEN],
        caller_aad: &[u8],
        ciphertext: &AeadCiphertext,
    ) -> Result<Vec<u8>, RatchetError> {
        let enc_key = message_encryption_key(message_key);
        let aad = header.aad(caller_aad);
        aead_decrypt(ciphertext, &enc_key, Some(&aad)).map_err(|_| RatchetError::DecryptionFailed)
    }

    fn dh_ratchet(&mut self, header: &RatchetHeader) -> Result<(), RatchetError> {
        if self.dh_remote.is_some() {
            self.skip_receive_keys(header.pn)?;
        }

        self.dh_remote = Some(header.dh_public);
        let recv_dh_output = derive_shared_secret(&self.dh_send_secret, &header.dh_public);
        let (new_root, recv_chain_key) = kdf_root(&self.root_key, &recv_dh_output);
        self.root_key = new_root;
        self.recv_chain_key = recv_chain_key;
        self.recv_n = 0;

        self.prev_send_n = self.send_n;
        self.send_n = 0;
        let (new_dh_public, new_dh_secret) = crate::crypto::generate_encryption_keypair();
        self.dh_send_public = new_dh_public;
        let send_dh_output = derive_shared_secret(&new_dh_secret, &header.dh_public);
        let (new_root2, send_chain_key) = kdf_root(&self.root_key, &send_dh_output);
        self.root_key = new_root2;
        self.send_chain_key = send_chain_key;
        self.dh_send_secret = new_dh_secret;

        Ok(())
    }

    /// Derive and store message keys for `recv_n..until`, bailing if that
    /// would push the skipped-key store over `max_skip`.
    fn skip_receive_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        if until < self.recv_n {
            return Ok(());
        }
        let skip_count = until - self.recv_n;
        if skip_count > self.max_skip || self.skipped_keys.len() as u32 + skip_count > self.max_skip {
            return Err(RatchetError::MaxSkipExceeded);
        }

        let dh_remote = self.dh_remote.unwrap_or([0u8; KEY_LEN]);
        while self.recv_n < until {
            let (new_chain_key, message_key) = kdf_chain(&self.recv_chain_key);
            self.recv_chain_key = new_chain_key;
            self.skipped_keys.insert((dh_remote, self.recv_n), message_key);
            self.recv_n += 1;
        }
        Ok(())
    }
}

/// `kdf_root`: HKDF(ikm = root||dh, info = "arbor-dr-root-v1", len = 64),
/// split into `(new_root_key, chain_key)`.
fn kdf_root(root_key: &[u8; KEY_LEN], dh_output: &[u8; KEY_LEN]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let mut ikm = Vec::with_capacity(KEY_LEN * 2);
    ikm.extend_from_slice(root_key);
    ikm.extend_from_slice(dh_output);
    let okm = derive_key(&ikm, b"arbor-dr-root-v1", KEY_LEN * 2);
    split64(&okm)
}

/// `kdf_chain`: HKDF(ikm = chain_key, info = "arbor-dr-chain-v1", len = 64),
/// split into `(new_chain_key, message_key)`.
fn kdf_chain(chain_key: &[u8; KEY_LEN]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let okm = derive_key(chain_key, b"arbor-dr-chain-v1", KEY_LEN * 2);
    split64(&okm)
}

/// Message encryption key = HKDF(message_key, "arbor-dr-msg-v1", 32).
fn message_encryption_key(message_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let okm = derive_key(message_key, b"arbor-dr-msg-v1", KEY_LEN);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&okm);
    key
}

fn split64(okm: &[u8]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let mut a = [0u8; KEY_LEN];
    let mut b = [0u8; KEY_LEN];
    a.copy_from_slice(&okm[..KEY_LEN]);
    b.copy_from_slice(&okm[KEY_LEN..]);
    (a, b)
}

mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
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

/// Serialize the skipped-key map as a flat list of `(dh_public_hex, n, key_hex)`
/// triples, since serde_json map keys must be strings and this map's key is
/// a tuple.
mod skipped_keys_serde {
    use super::KEY_LEN;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        dh_public: String,
        n: u32,
        key: String,
    }

    pub fn serialize<S: Serializer>(
        map: &HashMap<([u8; KEY_LEN], u32), [u8; KEY_LEN]>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<Entry> = map
            .iter()
            .map(|((dh, n), key)| Entry {
                dh_public: hex::encode(dh),
                n: *n,
                key: hex::encode(key),
            })
            .collect();
        entries.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<([u8; KEY_LEN], u32), [u8; KEY_LEN]>, D::Error> {
        let entries = Vec::<Entry>::deserialize(d)?;
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let dh_bytes = hex::decode(&entry.dh_public).map_err(serde::de::Error::custom)?;
            let dh: [u8; KEY_LEN] = dh_bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
            let key_bytes = hex::decode(&entry.key).map_err(serde::de::Error::custom)?;
            let key: [u8; KEY_LEN] = key_bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
            map.insert((dh, entry.n), key);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (RatchetSession, RatchetSession) {
        let shared_root = [42u8; KEY_LEN];
        let (bob_public, bob_secret) = crate::crypto::generate_encryption_keypair();
        let alice = RatchetSession::initiate(shared_root, bob_public);
        let bob = RatchetSession::respond(shared_root, bob_public, bob_secret);
        (alice, bob)
    }

    #[test]
    fn full_ratchet_round_trip() {
        let (mut alice, mut bob) = established_pair();

        for i in 0..3 {
            let msg = alice.encrypt(format!("hello {i}").as_bytes(), b"ctx");
            let plaintext = bob.decrypt(&msg, b"ctx").unwrap();
            assert_eq!(plaintext, format!("hello {i}").as_bytes());
        }

        for i in 0..2 {
            let msg = bob.encrypt(format!("reply {i}").as_bytes(), b"ctx");
            let plaintext = alice.decrypt(&msg, b"ctx").unwrap();
            assert_eq!(plaintext, format!("reply {i}").as_bytes());
        }

        let msg = alice.encrypt(b"after second dh ratchet", b"ctx");
        let plaintext = bob.decrypt(&msg, b"ctx").unwrap();
        assert_eq!(plaintext, b"after second dh ratchet");
    }

    #[test]
    fn out_of_order_messages_use_skipped_keys() {
        let (mut alice, mut bob) = established_pair();

        let m0 = alice.encrypt(b"zero", b"");
        let m1 = alice.encrypt(b"one", b"");
        let m2 = alice.encrypt(b"two", b"");

        assert_eq!(bob.decrypt(&m2, b"").unwrap(), b"two");
        assert_eq!(bob.decrypt(&m0, b"").unwrap(), b"zero");
        assert_eq!(bob.decrypt(&m1, b"").unwrap(), b"one");
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let (mut alice, mut bob) = established_pair();
        let mut msg = alice.encrypt(b"hello", b"");
        msg.ciphertext.tag[0] ^= 0xFF;
        assert_eq!(bob.decrypt(&msg, b""), Err(RatchetError::DecryptionFailed));
    }

    #[test]
    fn wrong_caller_aad_fails_to_decrypt() {
        let (mut alice, mut bob) = established_pair();
        let msg = alice.encrypt(b"hello", b"context-a");
        assert_eq!(bob.decrypt(&msg, b"context-b"), Err(RatchetError::DecryptionFailed));
    }

    #[test]
    fn skipping_too_many_messages_is_rejected() {
        let (mut alice, mut bob) = established_pair();

        let mut last = None;
        for i in 0..(DEFAULT_MAX_SKIP + 5) {
            last = Some(alice.encrypt(format!("{i}").as_bytes(), b""));
        }
        let result = bob.decrypt(&last.unwrap(), b"");
        assert_eq!(result, Err(RatchetError::MaxSkipExceeded));
    }
}
