//! Kernel configuration (spec §6 "Configuration (enumerated)").
//!
//! The kernel never loads this from disk or the environment itself — that
//! belongs to the excluded CLI/config layer. Callers build a `KernelConfig`
//! (or use [`KernelConfig::default`]) and hand it to [`crate::SecurityKernel::new`].

/// Every tunable the kernel understands, with the defaults spec.md §6 mandates.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub identity_verification: bool,
    pub nonce_ttl_seconds: i64,
    pub timestamp_max_drift_seconds: i64,

    pub capability_signing_required: bool,
    pub constraint_enforcement_enabled: bool,

    pub rate_limit_refill_period_seconds: f64,
    pub rate_limit_bucket_ttl_seconds: i64,
    pub rate_limit_cleanup_interval_ms: u64,

    pub consensus_escalation_enabled: bool,

    pub max_capabilities_per_agent: usize,
    pub max_global_capabilities: usize,
    pub max_delegation_depth: u32,
    pub quota_enforcement_enabled: bool,

    pub approval_guard_enabled: bool,

    pub master_key_path: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            identity_verification: true,
            nonce_ttl_seconds: 300,
            timestamp_max_drift_seconds: 60,

            capability_signing_required: false,
            constraint_enforcement_enabled: true,

            rate_limit_refill_period_seconds: 3600.0,
            rate_limit_bucket_ttl_seconds: 3600,
            rate_limit_cleanup_interval_ms: 300_000,

            consensus_escalation_enabled: true,

            max_capabilities_per_agent: 1000,
            max_global_capabilities: 100_000,
            max_delegation_depth: 10,
            quota_enforcement_enabled: true,

            approval_guard_enabled: false,

            master_key_path: ".arbor/security/master.key".to_string(),
        }
    }
}
