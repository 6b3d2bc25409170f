//! Consent ledger: every decision the gate makes, with revocation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::executor::consent::{ConsentDecision, ConsentGate, ConsentRequest};
use crate::executor::risk::RiskTier;
use crate::runtime::{MemoryEvent, MemoryStore};

/// Memory event type for recorded consent decisions.
pub const CONSENT_MEMORY_EVENT: &str = "consent_decision";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentEntry {
    pub action_type: String,
    pub description: String,
    pub risk: RiskTier,
    pub granted: bool,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Wraps a [`ConsentGate`] and logs each answer it gives.
///
/// Every request still reaches the inner gate; the ledger only records.
/// A gate error is logged as a denial, matching how the executor treats it.
/// When a memory store is attached, each decision is also saved there as a
/// [`CONSENT_MEMORY_EVENT`]; save failures are logged and dropped.
#[derive(Clone)]
pub struct ConsentLedger {
    inner: Arc<Inner>,
}

struct Inner {
    gate: Arc<dyn ConsentGate>,
    clock: Arc<dyn Clock>,
    memory: Option<Arc<dyn MemoryStore>>,
    entries: Mutex<Vec<ConsentEntry>>,
}

impl ConsentLedger {
    pub fn new(gate: Arc<dyn ConsentGate>, clock: Arc<dyn Clock>) -> Self {
        Self::build(gate, clock, None)
    }

    pub fn with_memory(gate: Arc<dyn ConsentGate>, clock: Arc<dyn Clock>, memory: Arc<dyn MemoryStore>) -> Self {
        Self::build(gate, clock, Some(memory))
    }

    fn build(gate: Arc<dyn ConsentGate>, clock: Arc<dyn Clock>, memory: Option<Arc<dyn MemoryStore>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate,
                clock,
                memory,
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// All decisions in the order they were made.
    pub fn entries(&self) -> Vec<ConsentEntry> {
        self.lock().clone()
    }

    /// Whether the latest decision for `action_type` is a grant that has not
    /// been revoked. Unknown action types are not granted.
    pub fn is_granted(&self, action_type: &str) -> bool {
        self.lock()
            .iter()
            .rev()
            .find(|e| e.action_type == action_type)
            .is_some_and(|e| e.granted && e.revoked_at.is_none())
    }

    /// Revoke every standing grant for `action_type`. Returns how many
    /// entries were revoked.
    pub fn revoke(&self, action_type: &str) -> usize {
        let now = self.inner.clock.now();
        let mut entries = self.lock();
        let mut revoked = 0;
        for entry in entries
            .iter_mut()
            .filter(|e| e.action_type == action_type && e.granted && e.revoked_at.is_none())
        {
            entry.revoked_at = Some(now);
            revoked += 1;
        }
        debug!(action_type, revoked, "Consent revoked");
        revoked
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConsentEntry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn remember(&self, entry: &ConsentEntry) {
        let Some(memory) = &self.inner.memory else {
            return;
        };
        let value = match serde_json::to_value(entry) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Could not encode consent decision");
                return;
            }
        };
        let event = MemoryEvent {
            event_type: CONSENT_MEMORY_EVENT.to_string(),
            value,
            metadata: Default::default(),
        };
        if let Err(e) = memory.save_event(event).await {
            warn!(action_type = %entry.action_type, error = %e, "Failed to record consent decision");
        }
    }
}

impl std::fmt::Debug for ConsentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentLedger")
            .field("entries", &self.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConsentGate for ConsentLedger {
    async fn check_consent(&self, request: ConsentRequest) -> anyhow::Result<ConsentDecision> {
        let outcome = self.inner.gate.check_consent(request.clone()).await;
        let granted = matches!(outcome, Ok(ConsentDecision { has_consent: true }));

        let entry = ConsentEntry {
            action_type: request.action_type,
            description: request.description,
            risk: request.risk,
            granted,
            decided_at: self.inner.clock.now(),
            revoked_at: None,
        };
        self.lock().push(entry.clone());
        self.remember(&entry).await;

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::consent::StaticConsent;
    use crate::runtime::InMemoryMemoryStore;

    struct BrokenGate;

    #[async_trait]
    impl ConsentGate for BrokenGate {
        async fn check_consent(&self, _request: ConsentRequest) -> anyhow::Result<ConsentDecision> {
            anyhow::bail!("prompt closed")
        }
    }

    struct FailingMemory;

    #[async_trait]
    impl MemoryStore for FailingMemory {
        async fn save_event(&self, _event: MemoryEvent) -> anyhow::Result<String> {
            anyhow::bail!("memory offline")
        }
    }

    fn request(action_type: &str) -> ConsentRequest {
        ConsentRequest {
            action_type: action_type.to_string(),
            description: format!("{action_type} on page"),
            risk: RiskTier::High,
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc::now()))
    }

    #[tokio::test]
    async fn records_each_decision() {
        let ledger = ConsentLedger::new(Arc::new(StaticConsent::allow_all()), clock());
        let decision = ledger.check_consent(request("click")).await.unwrap();
        assert!(decision.has_consent);
        ledger.check_consent(request("type")).await.unwrap();

        let entries = ledger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action_type, "click");
        assert!(entries.iter().all(|e| e.granted && e.revoked_at.is_none()));
        assert!(ledger.is_granted("click"));
        assert!(!ledger.is_granted("navigate"));
    }

    #[tokio::test]
    async fn gate_error_is_logged_as_denial() {
        let ledger = ConsentLedger::new(Arc::new(BrokenGate), clock());
        assert!(ledger.check_consent(request("click")).await.is_err());
        let entries = ledger.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].granted);
        assert!(!ledger.is_granted("click"));
    }

    #[tokio::test]
    async fn revoke_withdraws_standing_grants() {
        let clock = clock();
        let ledger = ConsentLedger::new(Arc::new(StaticConsent::allow_all()), clock.clone());
        ledger.check_consent(request("click")).await.unwrap();
        ledger.check_consent(request("click")).await.unwrap();
        ledger.check_consent(request("type")).await.unwrap();

        clock.advance(std::time::Duration::from_secs(5));
        assert_eq!(ledger.revoke("click"), 2);
        assert!(!ledger.is_granted("click"));
        assert!(ledger.is_granted("type"));
        assert_eq!(ledger.revoke("click"), 0);

        let revoked_at = ledger.entries()[0].revoked_at.unwrap();
        assert_eq!(revoked_at, clock.now());

        // A fresh grant supersedes the revocation.
        ledger.check_consent(request("click")).await.unwrap();
        assert!(ledger.is_granted("click"));
    }

    #[tokio::test]
    async fn decisions_are_saved_to_memory() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let ledger = ConsentLedger::with_memory(Arc::new(StaticConsent::deny_all()), clock(), memory.clone());
        ledger.check_consent(request("submit")).await.unwrap();

        let events = memory.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, CONSENT_MEMORY_EVENT);
        assert_eq!(events[0].value["actionType"], "submit");
        assert_eq!(events[0].value["granted"], false);
    }

    #[tokio::test]
    async fn memory_failure_does_not_change_the_answer() {
        let ledger = ConsentLedger::with_memory(Arc::new(StaticConsent::allow_all()), clock(), Arc::new(FailingMemory));
        assert!(ledger.check_consent(request("click")).await.unwrap().has_consent);
        assert_eq!(ledger.entries().len(), 1);
    }
}
