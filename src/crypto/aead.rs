//! AES-256-GCM seal/unseal with a fresh random IV per call.

use crate::error::CryptoError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AeadCiphertext {
    pub ct: Vec<u8>,
    pub iv: [u8; 12],
    pub tag: [u8; 16],
}

/// Encrypt `pt` under `key` (32 bytes), with an optional AAD, using a
/// freshly generated random 96-bit IV.
pub fn encrypt(pt: &[u8], key: &[u8; 32], aad: Option<&[u8]>) -> AeadCiphertext {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let payload = Payload {
        msg: pt,
        aad: aad.unwrap_or(&[]),
    };
    let mut out = cipher
        .encrypt(nonce, payload)
        .expect("AES-256-GCM encryption with a valid 32-byte key cannot fail");

    // `aes_gcm` appends the 16-byte tag to the ciphertext; split it back out
    // so the wire representation matches spec §4.1's `(ct, iv, tag)` triple.
    let tag_start = out.len() - 16;
    let tag_bytes = out.split_off(tag_start);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&tag_bytes);

    AeadCiphertext { ct: out, iv, tag }
}

pub fn decrypt(
    sealed: &AeadCiphertext,
    key: &[u8; 32],
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&sealed.iv);

    let mut combined = sealed.ct.clone();
    combined.extend_from_slice(&sealed.tag);

    let payload = Payload {
        msg: &combined,
        aad: aad.unwrap_or(&[]),
    };

    cipher
        .decrypt(nonce, payload)
        .map_err(|_| CryptoError::DecryptionFailed)
}
