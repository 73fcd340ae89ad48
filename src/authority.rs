//! System authority: the cluster-root signer (spec §4.3).
//!
//! Grounded on `hxrts-aura`'s `CapabilityToken` issuer model
//! (`other_examples/0425d8d8_hxrts-aura…capabilities.rs.rs`), specialized
//! from an M-of-N threshold signature to a single Ed25519 root keypair
//! that never leaves process memory.

use crate::capability::{signer, Capability};
use crate::crypto;
use crate::error::CapabilityError;
use crate::identity::{Identity, IdentityRegistry};
use std::sync::Arc;

/// Deterministic service agent-id the root authority registers itself
/// under, distinct from a hash-derived agent id so it's recognizable in
/// logs and audit events.
pub const SYSTEM_AUTHORITY_AGENT_ID: &str = "agent_system_authority";

pub struct SystemAuthority {
    public_key: [u8; 32],
    private_key: [u8; 64],
}

impl std::fmt::Debug for SystemAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemAuthority")
            .field("public_key", &hex::encode(self.public_key))
            .finish()
    }
}

impl SystemAuthority {
    /// Generate a fresh root keypair and register its public-only
    /// projection under [`SYSTEM_AUTHORITY_AGENT_ID`].
    pub fn bootstrap(registry: &Arc<IdentityRegistry>) -> Self {
        let (public_key, private_key) = crypto::generate_signing_keypair();
        let identity = Identity {
            agent_id: SYSTEM_AUTHORITY_AGENT_ID.to_string(),
            public_key,
            private_key: None,
            created_at: chrono::Utc::now(),
            metadata: Default::default(),
        };
        registry
            .register(identity)
            .expect("bootstrapping the system authority identity cannot collide");
        tracing::info!("system authority bootstrapped");
        Self {
            public_key,
            private_key,
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    pub fn agent_id(&self) -> &'static str {
        SYSTEM_AUTHORITY_AGENT_ID
    }

    /// Fill `issuer_id`/`issuer_signature` and return the signed capability.
    pub fn sign_capability(&self, cap: Capability) -> Capability {
        let mut cap = cap;
        cap.issuer_id = Some(SYSTEM_AUTHORITY_AGENT_ID.to_string());
        signer::sign(cap, &self.private_key)
    }

    /// Verify a capability's signature, using our own public key if we are
    /// the named issuer, otherwise looking the issuer up in the registry.
    pub fn verify_capability_signature(
        &self,
        cap: &Capability,
        registry: &IdentityRegistry,
    ) -> Result<(), CapabilityError> {
        let issuer_id = cap
            .issuer_id
            .as_deref()
            .ok_or(CapabilityError::InvalidCapabilitySignature)?;

        let issuer_public_key = if issuer_id == SYSTEM_AUTHORITY_AGENT_ID {
            self.public_key
        } else {
            registry
                .lookup(issuer_id)
                .map_err(|_| CapabilityError::InvalidCapabilitySignature)?
        };

        signer::verify(cap, &issuer_public_key)
    }
}
