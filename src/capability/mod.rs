//! Capability tokens: model, signing, indexed storage, persistence (spec §3, §4.4, §4.7).

pub mod model;
pub mod persistence;
pub mod signer;
pub mod store;

pub use model::{authorizes_resource, narrows, Capability, ConstraintValue, Constraints, DelegationRecord};
pub use persistence::{CapabilityPersistence, FilePersistence, InMemoryPersistence};
pub use store::{CapabilityStore, QuotaLimits};
