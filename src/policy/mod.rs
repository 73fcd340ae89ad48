//! Approval guard and consensus escalation (spec §4.8, §4.9).

pub mod escalation;
pub mod guard;

pub use escalation::{ConsensusModule, ConsensusProposal, Escalation};
pub use guard::{ApprovalOutcome, ApprovalPolicy, ConfirmationMode, Guard};
