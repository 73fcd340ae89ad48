//! Top-level authorization pipeline and the kernel's library surface
//! (spec §4.10, §6).
//!
//! No single teacher file matches `SecurityKernel` — it is composed
//! directly from the pipeline's seven stages, wiring every other module
//! the way `ccos::ccos_core::CCOS` wires its subsystems: one struct
//! holding `Arc`s to each service.

use crate::audit::{AuditEvent, AuditLog};
use crate::authority::SystemAuthority;
use crate::capability::{Capability, CapabilityPersistence, CapabilityStore, ConstraintValue, Constraints, QuotaLimits};
use crate::config::KernelConfig;
use crate::constraints::{self, RateLimiter};
use crate::error::{CapabilityError, IdentityError, KernelError, KernelResult};
use crate::identity::{Identity, IdentityRegistry, SignedRequest};
use crate::policy::{ApprovalOutcome, ApprovalPolicy, ConfirmationMode, ConsensusModule, Escalation, Guard};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationResult {
    Authorized,
    PendingApproval { proposal_id: String },
}

/// Per-call authorization context (spec §4.10's `opts`). When
/// `identity_verification` is enabled, `signed_request` must be present
/// and must match `principal_id`.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    pub signed_request: Option<SignedRequest>,
}

/// Stand-in trust-tier policy used until a caller wires a real one via
/// [`SecurityKernel::with_policy`]. Always auto-authorizes, matching
/// `approval_guard_enabled`'s off-by-default posture: the guard itself
/// decides whether this policy is even consulted.
struct AutoApprovalPolicy;

#[async_trait]
impl ApprovalPolicy for AutoApprovalPolicy {
    async fn confirmation_mode(&self, _principal_id: &str, _resource_uri: &str) -> Result<ConfirmationMode, crate::error::PolicyError> {
        Ok(ConfirmationMode::Auto)
    }

    async fn graduated(&self, _principal_id: &str, _resource_uri: &str) -> bool {
        true
    }
}

/// Wires identity, capability, constraint, approval, and audit subsystems
/// into the kernel's single library entry point.
pub struct SecurityKernel {
    config: KernelConfig,
    identity_registry: Arc<IdentityRegistry>,
    authority: Arc<SystemAuthority>,
    capability_store: Arc<CapabilityStore>,
    rate_limiter: Arc<RateLimiter>,
    guard: Arc<Guard>,
    escalation: Arc<Escalation>,
    audit: Arc<AuditLog>,
}

impl SecurityKernel {
    /// Build a kernel with the default always-auto approval policy and no
    /// consensus module. Suitable for deployments that leave
    /// `approval_guard_enabled` at its default of `false`.
    pub fn new(config: KernelConfig, persistence: Arc<dyn CapabilityPersistence>) -> Self {
        Self::with_policy(config, persistence, Arc::new(AutoApprovalPolicy), None)
    }

    pub fn with_policy(
        config: KernelConfig,
        persistence: Arc<dyn CapabilityPersistence>,
        approval_policy: Arc<dyn ApprovalPolicy>,
        consensus_module: Option<Arc<dyn ConsensusModule>>,
    ) -> Self {
        let identity_registry = Arc::new(IdentityRegistry::new(
            config.nonce_ttl_seconds,
            config.timestamp_max_drift_seconds,
        ));
        let authority = Arc::new(SystemAuthority::bootstrap(&identity_registry));
        let capability_store = Arc::new(CapabilityStore::new(
            QuotaLimits {
                max_per_principal: config.max_capabilities_per_agent,
                max_global: config.max_global_capabilities,
                max_delegation_depth: config.max_delegation_depth,
            },
            persistence,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_refill_period_seconds,
            config.rate_limit_bucket_ttl_seconds,
        ));
        let guard = Arc::new(Guard::new(config.approval_guard_enabled, approval_policy));
        let escalation = Arc::new(Escalation::new(config.consensus_escalation_enabled, consensus_module));
        let audit = Arc::new(AuditLog::new());

        Self {
            config,
            identity_registry,
            authority,
            capability_store,
            rate_limiter,
            guard,
            escalation,
            audit,
        }
    }

    /// Replay capabilities the persistence backend already held (e.g.
    /// across a restart) into the in-memory indices.
    pub async fn load_from_persistence(&self) -> std::io::Result<()> {
        self.capability_store.load_from_persistence().await
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn system_authority(&self) -> &SystemAuthority {
        &self.authority
    }

    /// Spawn the periodic sweeper spec.md §4.5/§4.7 expects: expired
    /// capabilities, stale rate-limit buckets, stale nonces, all on one
    /// 60-second tick.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let expired_caps = kernel.capability_store.sweep_expired().await;
                let expired_buckets = kernel.rate_limiter.sweep_expired();
                kernel.identity_registry.nonce_cache().sweep();
                tracing::debug!(expired_caps, expired_buckets, "sweeper tick");
            }
        })
    }

    pub fn register_identity(&self, identity: Identity) -> KernelResult<()> {
        self.identity_registry.register(identity.clone())?;
        self.audit.emit(AuditEvent::new(
            "identity_registered",
            serde_json::json!({ "agent_id": identity.agent_id }),
        ));
        Ok(())
    }

    pub fn lookup_identity(&self, agent_id: &str) -> KernelResult<[u8; 32]> {
        Ok(self.identity_registry.lookup(agent_id)?)
    }

    pub fn suspend_identity(&self, agent_id: &str) -> KernelResult<()> {
        self.identity_registry.suspend(agent_id)?;
        self.audit
            .emit(AuditEvent::new("identity_suspended", serde_json::json!({ "agent_id": agent_id })));
        Ok(())
    }

    pub fn resume_identity(&self, agent_id: &str) -> KernelResult<()> {
        self.identity_registry.resume(agent_id)?;
        self.audit
            .emit(AuditEvent::new("identity_resumed", serde_json::json!({ "agent_id": agent_id })));
        Ok(())
    }

    pub fn revoke_identity(&self, agent_id: &str) -> KernelResult<()> {
        self.identity_registry.revoke(agent_id)?;
        self.audit
            .emit(AuditEvent::new("identity_revoked", serde_json::json!({ "agent_id": agent_id })));
        Ok(())
    }

    /// Grant a fresh capability to `principal_id` over `resource_uri`
    /// (spec §6 `grant`). Signed with the system authority's key only when
    /// `capability_signing_required` is set; `action` rides along purely
    /// as audit-trail context since the URI grammar already encodes it.
    pub async fn grant(
        &self,
        principal_id: &str,
        resource_uri: &str,
        action: &str,
        constraints: Constraints,
        expires_at: Option<DateTime<Utc>>,
        metadata: HashMap<String, String>,
    ) -> KernelResult<Capability> {
        let mut cap = Capability::new(resource_uri.to_string(), principal_id.to_string()).with_constraints(constraints);
        if let Some(expires_at) = expires_at {
            cap = cap.with_expiry(expires_at);
        }
        cap.metadata = metadata;
        let cap = if self.config.capability_signing_required {
            self.authority.sign_capability(cap)
        } else {
            cap
        };

        self.capability_store.put(cap.clone()).await?;
        self.audit.emit(AuditEvent::new(
            "capability_granted",
            serde_json::json!({
                "capability_id": cap.id,
                "principal_id": cap.principal_id,
                "resource_uri": cap.resource_uri,
                "action": action,
            }),
        ));
        Ok(cap)
    }

    /// Delegate a narrower capability from `parent_id` to
    /// `child_principal_id` (spec §4.4). The delegator is `parent`'s own
    /// `principal_id`; `delegator_private_key` must be that principal's
    /// signing key.
    pub async fn delegate(
        &self,
        delegator_private_key: &[u8; 64],
        parent_id: &str,
        child_principal_id: &str,
        child_constraints: Constraints,
        expires_at: Option<DateTime<Utc>>,
    ) -> KernelResult<Capability> {
        let parent = self.capability_store.get(parent_id)?;

        if !parent.can_delegate() || self.capability_store.delegation_depth_exceeded(parent.delegation_chain.len()) {
            return Err(CapabilityError::QuotaExceeded {
                kind: "max_delegation_depth".to_string(),
                ctx: HashMap::new(),
            }
            .into());
        }
        if !crate::capability::narrows(&parent.constraints, &child_constraints) {
            return Err(CapabilityError::BrokenDelegationChain {
                index: parent.delegation_chain.len(),
            }
            .into());
        }

        let mut child = Capability::new(parent.resource_uri.clone(), child_principal_id.to_string())
            .with_constraints(child_constraints.clone())
            .with_delegation_depth(parent.delegation_depth - 1);
        if let Some(expires_at) = expires_at {
            child = child.with_expiry(expires_at);
        }
        child.parent_capability_id = Some(parent.id.clone());
        child.issuer_id = parent.issuer_id.clone();

        let record = crate::capability::signer::sign_delegation(&parent, &child.id, &child_constraints, delegator_private_key);
        child.delegation_chain = parent.delegation_chain.clone();
        child.delegation_chain.push(record);

        self.capability_store.put(child.clone()).await?;
        self.audit.emit(AuditEvent::new(
            "delegation_created",
            serde_json::json!({
                "parent_capability_id": parent.id,
                "child_capability_id": child.id,
                "delegator_id": parent.principal_id,
                "child_principal_id": child_principal_id,
            }),
        ));
        Ok(child)
    }

    pub async fn revoke(&self, capability_id: &str) -> KernelResult<()> {
        self.capability_store.revoke(capability_id).await?;
        self.audit
            .emit(AuditEvent::new("capability_revoked", serde_json::json!({ "capability_id": capability_id })));
        Ok(())
    }

    pub async fn cascade_revoke(&self, capability_id: &str) -> KernelResult<Vec<String>> {
        let revoked = self.capability_store.cascade_revoke(capability_id).await?;
        self.audit.emit(AuditEvent::new(
            "cascade_revocation",
            serde_json::json!({ "root_capability_id": capability_id, "revoked": revoked }),
        ));
        Ok(revoked)
    }

    pub async fn revoke_all(&self, principal_id: &str) -> Vec<String> {
        let revoked = self.capability_store.revoke_all(principal_id).await;
        self.audit.emit(AuditEvent::new(
            "capability_revoked",
            serde_json::json!({ "principal_id": principal_id, "revoked": revoked }),
        ));
        revoked
    }

    pub fn list_capabilities(&self, principal_id: &str) -> Vec<Capability> {
        self.capability_store.list_by_principal(principal_id)
    }

    /// Fast authorization check: capability lookup and constraint
    /// enforcement only, no approval guard or consensus escalation (spec
    /// §6 `can?`).
    pub async fn can(&self, principal_id: &str, resource_uri: &str) -> bool {
        let Some(cap) = self.capability_store.find_authorizing(principal_id, resource_uri) else {
            return false;
        };
        if !self.capability_signature_ok(&cap) {
            return false;
        }
        if self.config.constraint_enforcement_enabled
            && constraints::enforce(&cap.constraints, principal_id, resource_uri, &self.rate_limiter).is_err()
        {
            return false;
        }
        true
    }

    /// Run the full seven-stage pipeline (spec §4.10): identity
    /// verification, principal resolution, capability lookup,
    /// expiration/signature re-check, constraint enforcement, approval
    /// guard / escalation, and a dual-emit audit event.
    pub async fn authorize(
        &self,
        principal_id: &str,
        resource_uri: &str,
        action: &str,
        opts: AuthorizeOptions,
    ) -> KernelResult<AuthorizationResult> {
        if let Err(err) = self.verify_identity(principal_id, &opts) {
            return Err(self.deny(principal_id, resource_uri, action, err));
        }

        let cap = match self.capability_store.find_authorizing(principal_id, resource_uri) {
            Some(cap) => cap,
            None => {
                let err = CapabilityError::CapabilityNotFound(resource_uri.to_string()).into();
                return Err(self.deny(principal_id, resource_uri, action, err));
            }
        };

        if cap.is_expired() {
            let err = CapabilityError::CapabilityExpired(cap.id.clone()).into();
            return Err(self.deny(principal_id, resource_uri, action, err));
        }
        if !self.capability_signature_ok(&cap) {
            let err = CapabilityError::InvalidCapabilitySignature.into();
            return Err(self.deny(principal_id, resource_uri, action, err));
        }

        if self.config.constraint_enforcement_enabled {
            if let Err(err) = constraints::enforce(&cap.constraints, principal_id, resource_uri, &self.rate_limiter) {
                return Err(self.deny(principal_id, resource_uri, action, err.into()));
            }
        }

        let requires_approval = matches!(
            cap.constraints.get("requires_approval"),
            Some(ConstraintValue::RequiresApproval { required: true })
        );

        match self
            .guard
            .evaluate(principal_id, resource_uri, requires_approval, &self.escalation, &cap.id)
            .await
        {
            Ok((ApprovalOutcome::Authorized, _)) => {
                self.audit.emit(AuditEvent::new(
                    "authorization_granted",
                    serde_json::json!({
                        "principal_id": principal_id,
                        "resource_uri": resource_uri,
                        "action": action,
                        "capability_id": cap.id,
                    }),
                ));
                Ok(AuthorizationResult::Authorized)
            }
            Ok((ApprovalOutcome::PendingApproval, proposal_id)) => {
                let proposal_id = proposal_id.unwrap_or_default();
                self.audit.emit(AuditEvent::new(
                    "authorization_pending",
                    serde_json::json!({
                        "principal_id": principal_id,
                        "resource_uri": resource_uri,
                        "action": action,
                        "capability_id": cap.id,
                        "proposal_id": proposal_id,
                    }),
                ));
                Ok(AuthorizationResult::PendingApproval { proposal_id })
            }
            Err(err) => Err(self.deny(principal_id, resource_uri, action, err.into())),
        }
    }

    fn verify_identity(&self, principal_id: &str, opts: &AuthorizeOptions) -> Result<(), KernelError> {
        if self.config.identity_verification {
            let request = opts.signed_request.as_ref().ok_or(IdentityError::InvalidSignature)?;
            self.identity_registry.verify_signed_request(request)?;
        }
        self.identity_registry.require_active(principal_id)?;
        Ok(())
    }

    /// A capability with no `issuer_signature` is accepted unless
    /// `capability_signing_required` is set (migration path, spec §9 Open
    /// Question (b)); a signed one is always verified regardless.
    fn capability_signature_ok(&self, cap: &Capability) -> bool {
        if cap.is_signed() {
            self.authority.verify_capability_signature(cap, &self.identity_registry).is_ok()
        } else {
            !self.config.capability_signing_required
        }
    }

    fn deny(&self, principal_id: &str, resource_uri: &str, action: &str, err: KernelError) -> KernelError {
        self.audit.emit(AuditEvent::new(
            "authorization_denied",
            serde_json::json!({
                "principal_id": principal_id,
                "resource_uri": resource_uri,
                "action": action,
                "reason": err.to_string(),
            }),
        ));
        err
    }
}
