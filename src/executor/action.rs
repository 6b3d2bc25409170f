//! Primitive actions an executor run is made of.

use serde::{Deserialize, Serialize};

use crate::executor::risk::RiskTier;

/// One primitive step against the capability surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    Read {
        selector: String,
    },
    Navigate {
        url: String,
    },
    Extract {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute: Option<String>,
    },
    /// Store a value in the run's scratch map.
    Save {
        key: String,
        value: serde_json::Value,
    },
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default)]
        dy: i64,
    },
    Wait {
        ms: u64,
    },
}

impl Action {
    /// Wire name of the action type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Fill { .. } => "fill",
            Self::Read { .. } => "read",
            Self::Navigate { .. } => "navigate",
            Self::Extract { .. } => "extract",
            Self::Save { .. } => "save",
            Self::Scroll { .. } => "scroll",
            Self::Wait { .. } => "wait",
        }
    }

    pub fn risk(&self) -> RiskTier {
        RiskTier::of(self)
    }

    /// Short human-readable description, shown to the consent gate.
    pub fn describe(&self) -> String {
        match self {
            Self::Click { selector } => format!("click {selector}"),
            // The value may be sensitive; only its length is shown.
            Self::Fill { selector, value } => format!("fill {selector} with {} characters", value.chars().count()),
            Self::Read { selector } => format!("read {selector}"),
            Self::Navigate { url } => format!("navigate to {url}"),
            Self::Extract { selector, attribute } => match attribute {
                Some(attr) => format!("extract {attr} from {selector}"),
                None => format!("extract {selector}"),
            },
            Self::Save { key, .. } => format!("save {key}"),
            Self::Scroll { selector, dy } => match selector {
                Some(s) => format!("scroll {s} by {dy}"),
                None => format!("scroll page by {dy}"),
            },
            Self::Wait { ms } => format!("wait {ms}ms"),
        }
    }
}
