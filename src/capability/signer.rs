//! Pure capability-signing functions (spec §4.4).
//!
//! `canonical_payload` relies on `serde_json`'s default map representation
//! (a `BTreeMap`, since this crate does not enable the `preserve_order`
//! feature) to guarantee that two capabilities equal up to field/map-key
//! insertion order serialize to identical bytes.

use super::model::{Capability, Constraints, DelegationRecord};
use crate::crypto;
use crate::error::CapabilityError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Serialize)]
struct CanonicalCapability<'a> {
    id: &'a str,
    resource_uri: &'a str,
    principal_id: &'a str,
    granted_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    parent_capability_id: Option<&'a str>,
    delegation_depth: u32,
    constraints: &'a Constraints,
    issuer_id: Option<&'a str>,
    metadata: &'a HashMap<String, String>,
}

/// Deterministic byte encoding excluding `issuer_signature` and
/// `delegation_chain`, with map keys ordered lexicographically.
pub fn canonical_payload(cap: &Capability) -> Vec<u8> {
    let canonical = CanonicalCapability {
        id: &cap.id,
        resource_uri: &cap.resource_uri,
        principal_id: &cap.principal_id,
        granted_at: cap.granted_at,
        expires_at: cap.expires_at,
        parent_capability_id: cap.parent_capability_id.as_deref(),
        delegation_depth: cap.delegation_depth,
        constraints: &cap.constraints,
        issuer_id: cap.issuer_id.as_deref(),
        metadata: &cap.metadata,
    };
    let value = serde_json::to_value(&canonical).expect("Capability always serializes");
    serde_json::to_vec(&value).expect("serde_json::Value always serializes")
}

/// Sign `cap` with `priv`, setting `issuer_signature`. The caller is
/// responsible for having already set `issuer_id`.
pub fn sign(mut cap: Capability, priv_key: &[u8; 64]) -> Capability {
    let sig = crypto::sign(&canonical_payload(&cap), priv_key);
    cap.issuer_signature = Some(sig);
    cap
}

pub fn verify(cap: &Capability, pub_key: &[u8; 32]) -> Result<(), CapabilityError> {
    let sig = cap
        .issuer_signature
        .ok_or(CapabilityError::InvalidCapabilitySignature)?;
    if crypto::verify(&canonical_payload(cap), &sig, pub_key) {
        Ok(())
    } else {
        Err(CapabilityError::InvalidCapabilitySignature)
    }
}

/// Deterministic payload for a single delegation-chain link: ties the
/// record to the position it will occupy in the delegated capability's
/// chain and to that capability's id, so a link can't be replayed onto a
/// different descendant or reordered within the chain.
fn delegation_record_payload(child_id: &str, index: usize, record: &DelegationRecord) -> Vec<u8> {
    #[derive(Serialize)]
    struct Payload<'a> {
        child_id: &'a str,
        index: usize,
        delegator_id: &'a str,
        constraints: &'a Constraints,
        delegated_at: DateTime<Utc>,
    }
    let payload = Payload {
        child_id,
        index,
        delegator_id: &record.delegator_id,
        constraints: &record.constraints,
        delegated_at: record.delegated_at,
    };
    let value = serde_json::to_value(&payload).expect("delegation payload always serializes");
    serde_json::to_vec(&value).expect("serde_json::Value always serializes")
}

/// `parent` is the capability being delegated from; `child_id` and
/// `child_constraints` describe the new, narrower capability that will
/// carry this record as the next link in its `delegation_chain`.
pub fn sign_delegation(
    parent: &Capability,
    child_id: &str,
    child_constraints: &Constraints,
    delegator_priv: &[u8; 64],
) -> DelegationRecord {
    let index = parent.delegation_chain.len();
    let mut record = DelegationRecord {
        delegator_id: parent.principal_id.clone(),
        delegator_signature: [0u8; 64],
        constraints: child_constraints.clone(),
        delegated_at: Utc::now(),
    };
    let payload = delegation_record_payload(child_id, index, &record);
    record.delegator_signature = crypto::sign(&payload, delegator_priv);
    record
}

/// Verify every link of `cap.delegation_chain` in order against the
/// delegator's public key, resolved via `key_lookup`. `Ok` on an empty
/// chain (an undelegated, directly-granted capability).
pub fn verify_delegation_chain(
    cap: &Capability,
    key_lookup: impl Fn(&str) -> Option<[u8; 32]>,
) -> Result<(), CapabilityError> {
    for (index, record) in cap.delegation_chain.iter().enumerate() {
        let Some(public_key) = key_lookup(&record.delegator_id) else {
            return Err(CapabilityError::BrokenDelegationChain { index });
        };
        let payload = delegation_record_payload(&cap.id, index, record);
        if !crypto::verify(&payload, &record.delegator_signature, &public_key) {
            return Err(CapabilityError::BrokenDelegationChain { index });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::model::Capability;

    #[test]
    fn canonical_payload_ignores_field_order_in_maps() {
        let mut cap_a = Capability::new("arbor://fs/read/home".into(), "agent_x".into());
        cap_a.metadata.insert("a".into(), "1".into());
        cap_a.metadata.insert("b".into(), "2".into());

        let mut cap_b = cap_a.clone();
        cap_b.metadata = HashMap::new();
        cap_b.metadata.insert("b".into(), "2".into());
        cap_b.metadata.insert("a".into(), "1".into());

        assert_eq!(canonical_payload(&cap_a), canonical_payload(&cap_b));
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let (public, private) = crypto::generate_signing_keypair();
        let mut cap = Capability::new("arbor://fs/read/home".into(), "agent_x".into());
        cap.issuer_id = Some("agent_issuer".into());
        let signed = sign(cap, &private);
        assert!(verify(&signed, &public).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_capability() {
        let (public, private) = crypto::generate_signing_keypair();
        let mut cap = Capability::new("arbor://fs/read/home".into(), "agent_x".into());
        cap.issuer_id = Some("agent_issuer".into());
        let mut signed = sign(cap, &private);
        signed.resource_uri = "arbor://fs/read/other".into();
        assert_eq!(verify(&signed, &public), Err(CapabilityError::InvalidCapabilitySignature));
    }

    #[test]
    fn delegation_chain_of_one_verifies() {
        let (delegator_pub, delegator_priv) = crypto::generate_signing_keypair();
        let parent = Capability::new("arbor://fs/read/home".into(), "agent_delegator".into());
        let mut child_constraints = Constraints::new();
        child_constraints.insert(
            "rate_limit".into(),
            crate::capability::model::ConstraintValue::RateLimit { max_tokens: 5 },
        );

        let mut child = Capability::new("arbor://fs/read/home/docs".into(), "agent_child".into());
        let record = sign_delegation(&parent, &child.id, &child_constraints, &delegator_priv);
        child.delegation_chain.push(record);
        child.parent_capability_id = Some(parent.id.clone());

        let result = verify_delegation_chain(&child, |id| {
            if id == "agent_delegator" {
                Some(delegator_pub)
            } else {
                None
            }
        });
        assert!(result.is_ok());
    }

    #[test]
    fn broken_delegation_chain_is_detected() {
        let (_delegator_pub, delegator_priv) = crypto::generate_signing_keypair();
        let (wrong_pub, _) = crypto::generate_signing_keypair();
        let parent = Capability::new("arbor://fs/read/home".into(), "agent_delegator".into());
        let mut child = Capability::new("arbor://fs/read/home/docs".into(), "agent_child".into());
        let record = sign_delegation(&parent, &child.id, &Constraints::new(), &delegator_priv);
        child.delegation_chain.push(record);

        let result = verify_delegation_chain(&child, |_| Some(wrong_pub));
        assert_eq!(result, Err(CapabilityError::BrokenDelegationChain { index: 0 }));
    }
}
