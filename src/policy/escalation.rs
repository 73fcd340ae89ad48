//! Consensus escalation (spec §4.9).
//!
//! The consensus subsystem itself is out of scope here; this module only
//! needs the `submit`/`healthy` contract a real quorum implementation would
//! expose, in the same pluggable-trait shape as
//! `ccos::approval::types::ApprovalStorage`.

use crate::error::PolicyError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ConsensusProposal {
    pub proposer: String,
    pub topic: &'static str,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait ConsensusModule: Send + Sync {
    async fn submit(&self, proposal: ConsensusProposal) -> Result<String, PolicyError>;
    async fn healthy(&self) -> bool;
}

pub struct Escalation {
    consensus_escalation_enabled: bool,
    module: Option<Arc<dyn ConsensusModule>>,
}

impl Escalation {
    pub fn new(consensus_escalation_enabled: bool, module: Option<Arc<dyn ConsensusModule>>) -> Self {
        Self {
            consensus_escalation_enabled,
            module,
        }
    }

    /// Submit an `AuthorizationRequest` proposal and return its proposal id.
    ///
    /// A missing consensus module surfaces as `EscalationDisabled`, not
    /// `ConsensusUnavailable`: a deployment that never wired a module
    /// treats escalation as unavailable by configuration, not as a
    /// transient outage of a module that does exist.
    pub async fn escalate(
        &self,
        principal_id: &str,
        resource_uri: &str,
        capability_id: &str,
    ) -> Result<String, PolicyError> {
        if !self.consensus_escalation_enabled {
            return Err(PolicyError::EscalationDisabled);
        }
        let Some(module) = &self.module else {
            return Err(PolicyError::EscalationDisabled);
        };
        if !module.healthy().await {
            return Err(PolicyError::ConsensusUnavailable);
        }

        let mut metadata = HashMap::new();
        metadata.insert("principal".to_string(), principal_id.to_string());
        metadata.insert("resource".to_string(), resource_uri.to_string());
        metadata.insert("capability_id".to_string(), capability_id.to_string());

        let proposal = ConsensusProposal {
            proposer: principal_id.to_string(),
            topic: "AuthorizationRequest",
            description: format!("{principal_id} requests {resource_uri}"),
            metadata,
        };

        module
            .submit(proposal)
            .await
            .map_err(|_| PolicyError::ConsensusSubmissionFailed(resource_uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HealthyConsensus;
    #[async_trait]
    impl ConsensusModule for HealthyConsensus {
        async fn submit(&self, _proposal: ConsensusProposal) -> Result<String, PolicyError> {
            Ok("proposal_1".to_string())
        }
        async fn healthy(&self) -> bool {
            true
        }
    }

    struct UnhealthyConsensus;
    #[async_trait]
    impl ConsensusModule for UnhealthyConsensus {
        async fn submit(&self, _proposal: ConsensusProposal) -> Result<String, PolicyError> {
            Ok("unreachable".to_string())
        }
        async fn healthy(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn disabled_escalation_fails_closed() {
        let escalation = Escalation::new(false, Some(Arc::new(HealthyConsensus)));
        assert_eq!(
            escalation.escalate("agent_x", "arbor://fs/read/home", "cap_1").await,
            Err(PolicyError::EscalationDisabled)
        );
    }

    #[tokio::test]
    async fn missing_module_reports_escalation_disabled() {
        let escalation = Escalation::new(true, None);
        assert_eq!(
            escalation.escalate("agent_x", "arbor://fs/read/home", "cap_1").await,
            Err(PolicyError::EscalationDisabled)
        );
    }

    #[tokio::test]
    async fn unhealthy_module_reports_unavailable() {
        let escalation = Escalation::new(true, Some(Arc::new(UnhealthyConsensus)));
        assert_eq!(
            escalation.escalate("agent_x", "arbor://fs/read/home", "cap_1").await,
            Err(PolicyError::ConsensusUnavailable)
        );
    }

    #[tokio::test]
    async fn healthy_module_returns_proposal_id() {
        let escalation = Escalation::new(true, Some(Arc::new(HealthyConsensus)));
        let proposal_id = escalation
            .escalate("agent_x", "arbor://fs/read/home", "cap_1")
            .await
            .unwrap();
        assert_eq!(proposal_id, "proposal_1");
    }
}
