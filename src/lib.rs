//! Capability-based security kernel for a multi-agent orchestration
//! platform.
//!
//! Cryptographic identity, signed delegable capability tokens, a staged
//! authorization pipeline (identity → capability lookup → constraints →
//! approval guard → escalation → audit), and a per-peer forward-secret
//! Double Ratchet channel layer. The dashboard/UI, evaluation rubric,
//! consensus and trust-tier internals, OIDC device-flow mechanics, and
//! CLI/config-loading are out of scope — this crate only exposes the
//! contracts those layers plug into.

pub mod audit;
pub mod authority;
pub mod authorize;
pub mod capability;
pub mod config;
pub mod constraints;
pub mod crypto;
pub mod error;
pub mod fileguard;
pub mod identity;
pub mod keychain;
pub mod policy;
pub mod ratchet;
pub mod signing_key_store;

pub use audit::{AuditEvent, AuditLog};
pub use authority::SystemAuthority;
pub use authorize::{AuthorizationResult, AuthorizeOptions, SecurityKernel};
pub use capability::{Capability, CapabilityPersistence, CapabilityStore, ConstraintValue, Constraints};
pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use identity::{Identity, IdentityRegistry, IdentityStatus};
pub use keychain::Keychain;
pub use signing_key_store::SigningKeyStore;
