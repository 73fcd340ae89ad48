//! X25519 key agreement.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Generate an X25519 keypair (encryption keypair, distinct from the
/// Ed25519 signing keypair every principal also owns).
pub fn generate_encryption_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (*public.as_bytes(), secret.to_bytes())
}

/// ECDH: derive the shared secret between `my_priv` and `their_pub`.
pub fn derive_shared_secret(my_priv: &[u8; 32], their_pub: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*my_priv);
    let public = PublicKey::from(*their_pub);
    *secret.diffie_hellman(&public).as_bytes()
}
