//! Approval guard: auto / gated / deny gating entered after constraint
//! enforcement (spec §4.8).
//!
//! Grounded on `ccos::approval::types`'s pluggable, `async_trait` storage
//! pattern (`ApprovalStorage`/`ApprovalConsumer`), narrowed to the two
//! operations this kernel actually needs from a trust-tier subsystem:
//! `confirmation_mode` and `graduated?`. Trust-tier progression itself is
//! out of scope here — only this contract is.

use super::escalation::Escalation;
use crate::error::PolicyError;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationMode {
    Auto,
    Gated,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Authorized,
    PendingApproval,
}

/// A pluggable trust-tier policy service. `Err` means the service is
/// unavailable, not that the request is denied.
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    async fn confirmation_mode(
        &self,
        principal_id: &str,
        resource_uri: &str,
    ) -> Result<ConfirmationMode, PolicyError>;

    async fn graduated(&self, principal_id: &str, resource_uri: &str) -> bool;
}

pub struct Guard {
    enabled: bool,
    policy: std::sync::Arc<dyn ApprovalPolicy>,
}

impl Guard {
    pub fn new(enabled: bool, policy: std::sync::Arc<dyn ApprovalPolicy>) -> Self {
        Self { enabled, policy }
    }

    /// `requires_approval_constraint` is the `requires_approval` bit from
    /// the capability's constraints, used as a fallback when the guard is
    /// disabled or the policy service can't be reached.
    pub async fn evaluate(
        &self,
        principal_id: &str,
        resource_uri: &str,
        requires_approval_constraint: bool,
        escalation: &Escalation,
        capability_id: &str,
    ) -> Result<(ApprovalOutcome, Option<String>), PolicyError> {
        if !self.enabled {
            return self
                .fallback(requires_approval_constraint, principal_id, resource_uri, escalation, capability_id)
                .await;
        }

        match self.policy.confirmation_mode(principal_id, resource_uri).await {
            Ok(ConfirmationMode::Auto) => {
                tracing::info!(%principal_id, %resource_uri, "approval_auto");
                Ok((ApprovalOutcome::Authorized, None))
            }
            Ok(ConfirmationMode::Gated) => {
                if self.policy.graduated(principal_id, resource_uri).await {
                    tracing::info!(%principal_id, %resource_uri, "approval_graduated");
                    Ok((ApprovalOutcome::Authorized, None))
                } else {
                    self.escalate(principal_id, resource_uri, escalation, capability_id).await
                }
            }
            Ok(ConfirmationMode::Deny) => {
                tracing::info!(%principal_id, %resource_uri, "approval_denied");
                Err(PolicyError::PolicyDenied)
            }
            Err(_unavailable) => {
                self.fallback(requires_approval_constraint, principal_id, resource_uri, escalation, capability_id)
                    .await
            }
        }
    }

    async fn fallback(
        &self,
        requires_approval_constraint: bool,
        principal_id: &str,
        resource_uri: &str,
        escalation: &Escalation,
        capability_id: &str,
    ) -> Result<(ApprovalOutcome, Option<String>), PolicyError> {
        if requires_approval_constraint {
            self.escalate(principal_id, resource_uri, escalation, capability_id).await
        } else {
            Ok((ApprovalOutcome::Authorized, None))
        }
    }

    async fn escalate(
        &self,
        principal_id: &str,
        resource_uri: &str,
        escalation: &Escalation,
        capability_id: &str,
    ) -> Result<(ApprovalOutcome, Option<String>), PolicyError> {
        let proposal_id = escalation.escalate(principal_id, resource_uri, capability_id).await?;
        Ok((ApprovalOutcome::PendingApproval, Some(proposal_id)))
    }
}
