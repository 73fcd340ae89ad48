//! Ed25519 signing.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Generate an Ed25519 signing keypair: `(public, private)`.
///
/// The private half is the dalek "expanded" secret-plus-public encoding
/// (64 bytes), matching spec §3's `private_key: 64B` field.
pub fn generate_signing_keypair() -> ([u8; 32], [u8; 64]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public = signing_key.verifying_key().to_bytes();
    let mut private = [0u8; 64];
    private[..32].copy_from_slice(&signing_key.to_bytes());
    private[32..].copy_from_slice(&public);
    (public, private)
}

fn signing_key_from_bytes(private: &[u8; 64]) -> SigningKey {
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&private[..32]);
    SigningKey::from_bytes(&seed)
}

pub fn sign(msg: &[u8], private: &[u8; 64]) -> [u8; 64] {
    let signing_key = signing_key_from_bytes(private);
    signing_key.sign(msg).to_bytes()
}

pub fn verify(msg: &[u8], sig: &[u8; 64], public: &[u8; 32]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let signature = Signature::from_bytes(sig);
    verifying_key.verify(msg, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trip() {
        let (public, private) = generate_signing_keypair();
        let sig = sign(b"payload", &private);
        assert!(verify(b"payload", &sig, &public));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let (public, private) = generate_signing_keypair();
        let sig = sign(b"payload", &private);
        assert!(!verify(b"tampered", &sig, &public));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let (_public, private) = generate_signing_keypair();
        let (other_public, _) = generate_signing_keypair();
        let sig = sign(b"payload", &private);
        assert!(!verify(b"payload", &sig, &other_public));
    }
}
