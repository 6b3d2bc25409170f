//! Risk tiers and the consent rule.

use serde::{Deserialize, Serialize};

use crate::executor::action::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    /// Navigation leaves the current document, so it is high. Interactions
    /// that change the page are medium. Everything else is low.
    pub fn of(action: &Action) -> Self {
        match action {
            Action::Navigate { .. } => Self::High,
            Action::Click { .. } | Action::Fill { .. } => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Whether `action` must pass the consent gate. Clicks always do; other
/// medium/high actions do when the run asks for consent.
pub fn requires_consent(action: &Action, require_consent: bool) -> bool {
    matches!(action, Action::Click { .. }) || (require_consent && action.risk() >= RiskTier::Medium)
}
