//! Identity registry: agent-id → public key, with lifecycle state.
//!
//! Grounded on `ccos::secrets::SecretStore`'s shape (an in-memory map the
//! component owns exclusively, queried by name), generalized from secret
//! values to public keys plus a lifecycle status.

use super::{Identity, IdentityStatus, NonceCache, SignedRequest};
use crate::crypto;
use crate::error::IdentityError;
use chrono::Utc;
use dashmap::DashMap;

pub struct IdentityRegistry {
    entries: DashMap<String, (Identity, IdentityStatus)>,
    nonce_cache: NonceCache,
    timestamp_max_drift_seconds: i64,
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("count", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl IdentityRegistry {
    pub fn new(nonce_ttl_seconds: i64, timestamp_max_drift_seconds: i64) -> Self {
        Self {
            entries: DashMap::new(),
            nonce_cache: NonceCache::new(nonce_ttl_seconds),
            timestamp_max_drift_seconds,
        }
    }

    /// Idempotent for identical re-registration; rejects a different
    /// public key under an already-known agent id.
    pub fn register(&self, identity: Identity) -> Result<(), IdentityError> {
        let projection = identity.public_only();
        match self.entries.get(&projection.agent_id) {
            Some(existing) if existing.0.public_key != projection.public_key => {
                Err(IdentityError::InvalidSignature)
            }
            _ => {
                tracing::info!(agent_id = %projection.agent_id, "identity registered");
                self.entries
                    .insert(projection.agent_id.clone(), (projection, IdentityStatus::Active));
                Ok(())
            }
        }
    }

    pub fn lookup(&self, agent_id: &str) -> Result<[u8; 32], IdentityError> {
        self.entries
            .get(agent_id)
            .map(|e| e.0.public_key)
            .ok_or_else(|| IdentityError::UnknownPrincipal(agent_id.to_string()))
    }

    pub fn status(&self, agent_id: &str) -> Result<IdentityStatus, IdentityError> {
        self.entries
            .get(agent_id)
            .map(|e| e.1)
            .ok_or_else(|| IdentityError::UnknownPrincipal(agent_id.to_string()))
    }

    pub fn unregister(&self, agent_id: &str) {
        self.entries.remove(agent_id);
    }

    pub fn suspend(&self, agent_id: &str) -> Result<(), IdentityError> {
        self.set_status(agent_id, IdentityStatus::Suspended)
    }

    pub fn resume(&self, agent_id: &str) -> Result<(), IdentityError> {
        self.set_status(agent_id, IdentityStatus::Active)
    }

    pub fn revoke(&self, agent_id: &str) -> Result<(), IdentityError> {
        self.set_status(agent_id, IdentityStatus::Revoked)
    }

    fn set_status(&self, agent_id: &str, status: IdentityStatus) -> Result<(), IdentityError> {
        let mut entry = self
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| IdentityError::UnknownPrincipal(agent_id.to_string()))?;
        entry.1 = status;
        Ok(())
    }

    /// Require the principal to be `Active`; surfaces suspended/revoked as
    /// their own distinct errors per spec §7.
    pub fn require_active(&self, agent_id: &str) -> Result<(), IdentityError> {
        match self.status(agent_id)? {
            IdentityStatus::Active => Ok(()),
            IdentityStatus::Suspended => Err(IdentityError::IdentitySuspended(agent_id.to_string())),
            IdentityStatus::Revoked => Err(IdentityError::IdentityRevoked(agent_id.to_string())),
        }
    }

    /// Verify a signed request's Ed25519 signature, staleness, and replay
    /// state, per spec §4.2.
    pub fn verify_signed_request(&self, request: &SignedRequest) -> Result<(), IdentityError> {
        let public_key = self.lookup(&request.principal_id)?;

        if !crypto::verify(&request.canonical_bytes(), &request.signature, &public_key) {
            return Err(IdentityError::InvalidSignature);
        }

        let drift = (Utc::now() - request.timestamp).num_seconds().abs();
        if drift > self.timestamp_max_drift_seconds {
            return Err(IdentityError::StaleTimestamp);
        }

        if !self.nonce_cache.check_and_insert(&request.nonce) {
            return Err(IdentityError::ReplayedNonce);
        }

        Ok(())
    }

    pub fn nonce_cache(&self) -> &NonceCache {
        &self.nonce_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_request(agent_id: &str, private: &[u8; 64], nonce: &str) -> SignedRequest {
        let mut req = SignedRequest {
            principal_id: agent_id.to_string(),
            resource_uri: "arbor://fs/read/home".to_string(),
            action: "read".to_string(),
            timestamp: Utc::now(),
            nonce: nonce.to_string(),
            signature: [0u8; 64],
        };
        req.signature = crypto::sign(&req.canonical_bytes(), private);
        req
    }

    #[test]
    fn register_then_lookup() {
        let registry = IdentityRegistry::new(300, 60);
        let identity = crate::identity::Identity::generate();
        registry.register(identity.clone()).unwrap();
        assert_eq!(registry.lookup(&identity.agent_id).unwrap(), identity.public_key);
    }

    #[test]
    fn idempotent_reregistration_of_same_key_is_ok() {
        let registry = IdentityRegistry::new(300, 60);
        let identity = crate::identity::Identity::generate();
        registry.register(identity.clone()).unwrap();
        registry.register(identity.public_only()).unwrap();
    }

    #[test]
    fn reregistration_with_different_key_is_rejected() {
        let registry = IdentityRegistry::new(300, 60);
        let identity = crate::identity::Identity::generate();
        registry.register(identity.clone()).unwrap();

        let mut impostor = crate::identity::Identity::generate();
        impostor.agent_id = identity.agent_id.clone();
        assert!(registry.register(impostor).is_err());
    }

    #[test]
    fn unknown_principal_lookup_fails() {
        let registry = IdentityRegistry::new(300, 60);
        assert_eq!(
            registry.lookup("agent_deadbeef"),
            Err(IdentityError::UnknownPrincipal("agent_deadbeef".to_string()))
        );
    }

    #[test]
    fn replay_of_same_nonce_is_rejected() {
        let registry = IdentityRegistry::new(300, 60);
        let identity = crate::identity::Identity::generate();
        let private = identity.private_key.unwrap();
        registry.register(identity.public_only()).unwrap();

        let req = signed_request(&identity.agent_id, &private, "nonce-1");
        registry.verify_signed_request(&req).unwrap();
        assert_eq!(
            registry.verify_signed_request(&req),
            Err(IdentityError::ReplayedNonce)
        );
    }

    #[test]
    fn suspended_identity_is_reported() {
        let registry = IdentityRegistry::new(300, 60);
        let identity = crate::identity::Identity::generate();
        registry.register(identity.public_only()).unwrap();
        registry.suspend(&identity.agent_id).unwrap();
        assert_eq!(
            registry.require_active(&identity.agent_id),
            Err(IdentityError::IdentitySuspended(identity.agent_id.clone()))
        );
    }
}
