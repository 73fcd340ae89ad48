//! Cryptographic identity + registry + nonce cache (spec §3, §4.2).

mod nonce;
mod registry;

pub use nonce::NonceCache;
pub use registry::IdentityRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A principal's identity. `private_key` is only ever populated for the
/// owning agent's own copy; the registry only ever stores the public
/// projection (see [`Identity::public_only`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub agent_id: String,
    #[serde(with = "hex_32")]
    pub public_key: [u8; 32],
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_hex_64")]
    pub private_key: Option<[u8; 64]>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Lifecycle state tracked by the registry for revocation/suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityStatus {
    Active,
    Suspended,
    Revoked,
}

impl Identity {
    /// Generate a fresh identity with a newly minted Ed25519 keypair.
    pub fn generate() -> Self {
        let (public_key, private_key) = crate::crypto::generate_signing_keypair();
        let agent_id = crate::crypto::derive_agent_id(&public_key);
        Self {
            agent_id,
            public_key,
            private_key: Some(private_key),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Bind an identity to an externally-issued public key (e.g. OIDC
    /// device-flow binding). The caller never learns a private key here.
    pub fn bind_external(agent_id: String, public_key: [u8; 32]) -> Self {
        Self {
            agent_id,
            public_key,
            private_key: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Strip the private key, producing the projection that is safe to
    /// register and share.
    pub fn public_only(&self) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            public_key: self.public_key,
            private_key: None,
            created_at: self.created_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// A request carrying a signature over `(principal_id, resource_uri,
/// action, timestamp, nonce)`, per spec §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    pub principal_id: String,
    pub resource_uri: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
    #[serde(with = "hex_64")]
    pub signature: [u8; 64],
}

impl SignedRequest {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}\0{}\0{}\0{}\0{}",
            self.principal_id,
            self.resource_uri,
            self.action,
            self.timestamp.to_rfc3339(),
            self.nonce
        )
        .into_bytes()
    }
}

mod hex_32 {
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

mod hex_64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

mod opt_hex_64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<[u8; 64]>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 64]>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
                let arr = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 64 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_matches_invariant() {
        let identity = Identity::generate();
        assert_eq!(
            identity.agent_id,
            crate::crypto::derive_agent_id(&identity.public_key)
        );
    }

    #[test]
    fn public_only_strips_private_key() {
        let identity = Identity::generate();
        assert!(identity.private_key.is_some());
        assert!(identity.public_only().private_key.is_none());
    }
}
