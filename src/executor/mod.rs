//! Agent executor: ordered primitive actions under risk and consent policy,
//! with an audit entry for every attempt.

pub mod action;
pub mod audit;
pub mod consent;
pub mod ledger;
pub mod policy;
pub mod risk;
pub mod runner;
pub mod surface;

pub use action::Action;
pub use audit::{AuditLog, AuditLogEntry, AuditResult};
pub use consent::{ConsentDecision, ConsentGate, ConsentRequest, StaticConsent};
pub use ledger::{CONSENT_MEMORY_EVENT, ConsentEntry, ConsentLedger};
pub use policy::DomainPolicy;
pub use risk::{RiskTier, requires_consent};
pub use runner::{AgentExecutor, ExecutionResult, ExecutorOptions};
pub use surface::{InMemorySurface, Navigator, Surface};
