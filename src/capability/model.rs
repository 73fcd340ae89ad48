//! Capability token + delegation record types (spec §3).
//!
//! Grounded on `hxrts-aura`'s `CapabilityToken`/`DelegationProof`/
//! `CapabilityCondition` shapes
//! (`other_examples/0425d8d8_hxrts-aura…capabilities.rs.rs`), adapted from
//! M-of-N threshold signatures to a single Ed25519 issuer signature and
//! from free-form attenuation to this spec's constraint-narrowing rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Default remaining-delegation budget for a freshly granted capability
/// (spec §3: "delegation_depth: u32 (default 3)").
pub const DEFAULT_DELEGATION_DEPTH: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintValue {
    TimeWindow { start_hour: u32, end_hour: u32 },
    AllowedPaths { paths: Vec<String> },
    RateLimit { max_tokens: u32 },
    RequiresApproval { required: bool },
    /// Forward-compatible: any constraint key this build doesn't know
    /// about yet, preserved verbatim through serialization (spec §9).
    Unknown { raw: serde_json::Value },
}

pub type Constraints = HashMap<String, ConstraintValue>;

/// A single link in a capability's delegation chain (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegationRecord {
    pub delegator_id: String,
    #[serde(with = "sig_hex")]
    pub delegator_signature: [u8; 64],
    pub constraints: Constraints,
    pub delegated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub id: String,
    pub resource_uri: String,
    pub principal_id: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent_capability_id: Option<String>,
    pub delegation_depth: u32,
    pub constraints: Constraints,
    pub issuer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "opt_sig_hex")]
    pub issuer_signature: Option<[u8; 64]>,
    #[serde(default)]
    pub delegation_chain: Vec<DelegationRecord>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Capability {
    /// Construct a fresh, unsigned, undelegated capability grant.
    pub fn new(resource_uri: String, principal_id: String) -> Self {
        Self {
            id: format!("cap_{}", Uuid::new_v4()),
            resource_uri,
            principal_id,
            granted_at: Utc::now(),
            expires_at: None,
            parent_capability_id: None,
            delegation_depth: DEFAULT_DELEGATION_DEPTH,
            constraints: Constraints::new(),
            issuer_id: None,
            issuer_signature: None,
            delegation_chain: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_delegation_depth(mut self, delegation_depth: u32) -> Self {
        self.delegation_depth = delegation_depth;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|e| e < Utc::now()).unwrap_or(false)
    }

    pub fn is_signed(&self) -> bool {
        self.issuer_signature.is_some()
    }

    pub fn can_delegate(&self) -> bool {
        self.delegation_depth > 0
    }

    /// `resource` is authorized by this capability's `resource_uri` under
    /// the mandatory prefix-with-separator rule (spec §3/§4.7): exact
    /// match, or `resource == resource_uri + "/" + rest`.
    pub fn authorizes_resource(&self, resource: &str) -> bool {
        authorizes_resource(&self.resource_uri, resource)
    }
}

/// True if `child` is a constraint-by-constraint narrowing of `parent`
/// (spec §3): a rate limit may only shrink, a time window may only shrink,
/// and allowed-paths may only intersect. Introducing a brand-new
/// restriction the parent never had is always a narrowing. Unknown
/// constraint keys are compared for equality only — a build that doesn't
/// understand a constraint can't prove it narrows, so it must pass it
/// through unchanged.
pub fn narrows(parent: &Constraints, child: &Constraints) -> bool {
    for (key, child_value) in child {
        let Some(parent_value) = parent.get(key) else {
            continue; // new restriction, not present in parent: always narrows
        };
        let ok = match (parent_value, child_value) {
            (
                ConstraintValue::RateLimit { max_tokens: p },
                ConstraintValue::RateLimit { max_tokens: c },
            ) => c <= p,
            (
                ConstraintValue::TimeWindow {
                    start_hour: ps,
                    end_hour: pe,
                },
                ConstraintValue::TimeWindow {
                    start_hour: cs,
                    end_hour: ce,
                },
            ) => hour_window_set(*ps, *pe).is_superset(&hour_window_set(*cs, *ce)),
            (
                ConstraintValue::AllowedPaths { paths: p },
                ConstraintValue::AllowedPaths { paths: c },
            ) => c
                .iter()
                .all(|child_path| p.iter().any(|parent_path| authorizes_resource(parent_path, child_path))),
            (
                ConstraintValue::RequiresApproval { required: p },
                ConstraintValue::RequiresApproval { required: c },
            ) => *c || !*p, // turning approval ON narrows; turning it OFF does not
            (ConstraintValue::Unknown { raw: p }, ConstraintValue::Unknown { raw: c }) => p == c,
            _ => false, // changing a constraint's kind is never a narrowing
        };
        if !ok {
            return false;
        }
    }
    true
}

fn hour_window_set(start: u32, end: u32) -> std::collections::HashSet<u32> {
    let mut set = std::collections::HashSet::new();
    if start <= end {
        (start..end).for_each(|h| {
            set.insert(h);
        });
    } else {
        (start..24).chain(0..end).for_each(|h| {
            set.insert(h);
        });
    }
    set
}

/// Exact match OR `resource == granted + "/" + rest`. The separator is
/// mandatory: `arbor://fs/read/home` must not authorize
/// `arbor://fs/read/home_config` (spec §3, §8 scenario 1).
pub fn authorizes_resource(granted: &str, resource: &str) -> bool {
    resource == granted || resource.starts_with(&format!("{granted}/"))
}

mod sig_hex {
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

mod opt_sig_hex {
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
    fn prefix_separator_is_mandatory() {
        assert!(authorizes_resource("arbor://fs/read/home", "arbor://fs/read/home"));
        assert!(authorizes_resource(
            "arbor://fs/read/home",
            "arbor://fs/read/home/x.txt"
        ));
        assert!(!authorizes_resource(
            "arbor://fs/read/home",
            "arbor://fs/read/home_config"
        ));
    }

    #[test]
    fn fresh_capability_has_default_budget_and_no_chain() {
        let cap = Capability::new("arbor://fs/read/home".into(), "agent_x".into());
        assert_eq!(cap.delegation_depth, DEFAULT_DELEGATION_DEPTH);
        assert!(cap.delegation_chain.is_empty());
        assert!(!cap.is_expired());
        assert!(cap.can_delegate());
    }

    #[test]
    fn rate_limit_can_only_shrink() {
        let mut parent = Constraints::new();
        parent.insert("rate_limit".into(), ConstraintValue::RateLimit { max_tokens: 10 });

        let mut shrinking = Constraints::new();
        shrinking.insert("rate_limit".into(), ConstraintValue::RateLimit { max_tokens: 5 });
        assert!(narrows(&parent, &shrinking));

        let mut widening = Constraints::new();
        widening.insert("rate_limit".into(), ConstraintValue::RateLimit { max_tokens: 20 });
        assert!(!narrows(&parent, &widening));
    }

    #[test]
    fn allowed_paths_can_only_intersect() {
        let mut parent = Constraints::new();
        parent.insert(
            "allowed_paths".into(),
            ConstraintValue::AllowedPaths {
                paths: vec!["arbor://fs/read/home".into()],
            },
        );

        let mut narrower = Constraints::new();
        narrower.insert(
            "allowed_paths".into(),
            ConstraintValue::AllowedPaths {
                paths: vec!["arbor://fs/read/home/docs".into()],
            },
        );
        assert!(narrows(&parent, &narrower));

        let mut broader = Constraints::new();
        broader.insert(
            "allowed_paths".into(),
            ConstraintValue::AllowedPaths {
                paths: vec!["arbor://fs/read/other".into()],
            },
        );
        assert!(!narrows(&parent, &broader));
    }

    #[test]
    fn expiry_in_the_past_is_expired() {
        let cap = Capability::new("arbor://fs/read/home".into(), "agent_x".into())
            .with_expiry(Utc::now() - chrono::Duration::seconds(1));
        assert!(cap.is_expired());
    }
}
