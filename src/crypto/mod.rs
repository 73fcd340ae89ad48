//! Pure, stateless cryptographic primitives (spec §4.1).
//!
//! Grounded on the ed25519-dalek / x25519-dalek / hkdf / aes-gcm pairing
//! found in `other_examples`' `hxrts-aura` and `chad-freeq` manifests, and
//! on the HKDF usage in the Double Ratchet reference
//! (`other_examples/…darklock-guard…ratchet.rs.rs`).

mod aead;
mod exchange;
mod signing;

pub use aead::{decrypt, encrypt, AeadCiphertext};
pub use exchange::{derive_shared_secret, generate_encryption_keypair};
pub use signing::{generate_signing_keypair, sign, verify};

use sha2::{Digest, Sha256};

/// SHA-256 hash.
pub fn hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `agent_<hex(sha256(public_key))>`, per spec §3's identity invariant.
pub fn derive_agent_id(public_key: &[u8; 32]) -> String {
    format!("agent_{}", hex::encode(hash(public_key)))
}

/// HKDF-SHA-256 key derivation into a caller-sized buffer.
pub fn derive_key(ikm: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let hk = hkdf::Hkdf::<Sha256>::new(None, ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .expect("HKDF output length must be <= 255 * hash length");
    okm
}

/// One-shot ECDH + AEAD seal to a recipient's X25519 public key.
///
/// Generates an ephemeral keypair, derives a shared secret with the
/// recipient's public key, and uses that as the AES-256-GCM key. The
/// ephemeral public key travels alongside the ciphertext so the recipient
/// can redo the ECDH step; this is the "else one-shot ECDH seal" branch of
/// spec §4.12's `seal_for_peer`.
pub fn seal(
    plaintext: &[u8],
    recipient_public: &[u8; 32],
    sender_private: &[u8; 32],
) -> AeadCiphertext {
    let shared = exchange::derive_shared_secret(sender_private, recipient_public);
    let key = derive_key(&shared, b"arbor-seal-v1", 32);
    let mut key_arr = [0u8; 32];
    key_arr.copy_from_slice(&key);
    aead::encrypt(plaintext, &key_arr, None)
}

pub fn unseal(
    sealed: &AeadCiphertext,
    sender_public: &[u8; 32],
    recipient_private: &[u8; 32],
) -> Result<Vec<u8>, crate::error::CryptoError> {
    let shared = exchange::derive_shared_secret(recipient_private, sender_public);
    let key = derive_key(&shared, b"arbor-seal-v1", 32);
    let mut key_arr = [0u8; 32];
    key_arr.copy_from_slice(&key);
    aead::decrypt(sealed, &key_arr, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_agent_id_is_deterministic() {
        let (pk, _) = generate_signing_keypair();
        assert_eq!(derive_agent_id(&pk), derive_agent_id(&pk));
    }

    #[test]
    fn seal_unseal_round_trip() {
        let (recipient_pub, recipient_priv) = generate_encryption_keypair();
        let (_sender_pub, sender_priv) = generate_encryption_keypair();
        let sealed = seal(b"hello peer", &recipient_pub, &sender_priv);
        let sender_pub_derived = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(sender_priv));
        let plaintext = unseal(&sealed, sender_pub_derived.as_bytes(), &recipient_priv).unwrap();
        assert_eq!(plaintext, b"hello peer");
    }
}
