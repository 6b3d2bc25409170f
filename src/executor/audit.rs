//! Append-only audit trail of attempted actions, keyed by run id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::action::Action;
use crate::executor::risk::RiskTier;

/// How an attempted action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    ConsentDenied,
    DomainBlocked,
    /// Cut short by the run deadline.
    Timeout,
    Cancelled,
}

impl AuditResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One attempted action. Never modified after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub run_id: Uuid,
    /// Position of the action within its run, from zero.
    pub sequence: usize,
    pub action: Action,
    pub risk: RiskTier,
    pub consent_required: bool,
    /// `None` when consent was not asked for.
    pub consent_granted: Option<bool>,
    pub result: AuditResult,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Shared audit store. Entries are only ever appended.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    runs: Arc<Mutex<HashMap<Uuid, Vec<AuditLogEntry>>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, entry: AuditLogEntry) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(entry.run_id)
            .or_default()
            .push(entry);
    }

    /// Entries of one run, in action order.
    pub fn entries(&self, run_id: Uuid) -> Vec<AuditLogEntry> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn run_ids(&self) -> Vec<Uuid> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Total entries across all runs.
    pub fn len(&self) -> usize {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
