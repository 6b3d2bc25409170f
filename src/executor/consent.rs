//! Consent gate contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::executor::risk::RiskTier;

/// What the gate is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    #[serde(rename = "type")]
    pub action_type: String,
    pub description: String,
    pub risk: RiskTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentDecision {
    pub has_consent: bool,
}

/// External approver for risky actions (usually a prompt in the host UI).
/// An error from the gate is treated as a denial.
#[async_trait]
pub trait ConsentGate: Send + Sync {
    async fn check_consent(&self, request: ConsentRequest) -> anyhow::Result<ConsentDecision>;
}

/// Answers every request the same way.
#[derive(Debug, Clone, Copy)]
pub struct StaticConsent {
    pub granted: bool,
}

impl StaticConsent {
    pub fn allow_all() -> Self {
        Self { granted: true }
    }

    pub fn deny_all() -> Self {
        Self { granted: false }
    }
}

#[async_trait]
impl ConsentGate for StaticConsent {
    async fn check_consent(&self, _request: ConsentRequest) -> anyhow::Result<ConsentDecision> {
        Ok(ConsentDecision {
            has_consent: self.granted,
        })
    }
}
