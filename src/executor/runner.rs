//! The executor run loop.
//!
//! A run walks its actions strictly in order. Each attempt goes through the
//! domain policy (navigation only), then the consent gate, then the primitive,
//! and leaves exactly one audit entry behind. The first failure or block stops
//! the run. Running out of steps or wall-clock time truncates it instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ExecutorError, Failure, FailureKind};
use crate::events::{Event, EventBus};
use crate::executor::action::Action;
use crate::executor::audit::{AuditLog, AuditLogEntry, AuditResult};
use crate::executor::consent::{ConsentGate, ConsentRequest};
use crate::executor::policy::DomainPolicy;
use crate::executor::risk::requires_consent;
use crate::executor::surface::{Navigator, Surface};

/// Per-run safety settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Ask the consent gate for every medium/high-risk action. Clicks are
    /// gated regardless.
    pub require_consent: bool,
    /// Wall-clock budget for the whole run.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// At most this many actions are attempted.
    pub max_steps: usize,
    pub allowed_domains: Vec<String>,
    pub denied_domains: Vec<String>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            require_consent: true,
            timeout: Duration::from_secs(30),
            max_steps: 50,
            allowed_domains: Vec::new(),
            denied_domains: Vec::new(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// No action failed, nothing was blocked and the run was not cancelled.
    pub success: bool,
    /// Stopped by the consent gate or the domain policy.
    pub blocked: bool,
    /// Actions were left unattempted because of the step or time budget.
    pub truncated: bool,
    /// Actions attempted (one audit entry each).
    pub steps: usize,
    pub error: Option<Failure>,
    pub entries: Vec<AuditLogEntry>,
    /// Values produced by `read` and `extract`, in order.
    pub outputs: Vec<serde_json::Value>,
    /// Values stored by `save`.
    pub saved: serde_json::Map<String, serde_json::Value>,
}

enum Step {
    Continue(Option<serde_json::Value>),
    Blocked(Failure),
    Failed(Failure),
    DeadlineHit,
    Cancelled,
}

/// Runs action sequences against a surface under risk and consent policy.
#[derive(Clone)]
pub struct AgentExecutor {
    bus: EventBus,
    surface: Arc<dyn Surface>,
    navigator: Arc<dyn Navigator>,
    consent: Arc<dyn ConsentGate>,
    audit: AuditLog,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl AgentExecutor {
    pub fn new(
        bus: EventBus,
        surface: Arc<dyn Surface>,
        navigator: Arc<dyn Navigator>,
        consent: Arc<dyn ConsentGate>,
    ) -> Self {
        Self {
            bus,
            surface,
            navigator,
            consent,
            audit: AuditLog::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Ids of runs still in progress.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Run `actions` with a fresh cancellation scope.
    pub async fn execute(&self, actions: Vec<Action>, options: &ExecutorOptions) -> ExecutionResult {
        self.execute_with_cancel(actions, options, &CancellationToken::new())
            .await
    }

    /// Run `actions`; cancelling `parent` cancels the run.
    pub async fn execute_with_cancel(
        &self,
        actions: Vec<Action>,
        options: &ExecutorOptions,
        parent: &CancellationToken,
    ) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        let token = parent.child_token();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id, token.clone());

        info!(run_id = %run_id, actions = actions.len(), "Executor run started");
        self.bus.emit(Event::RunStarted {
            run_id,
            action_count: actions.len(),
        });

        let deadline = Instant::now() + options.timeout;
        let policy = DomainPolicy::new(&options.allowed_domains, &options.denied_domains);
        let total = actions.len();

        let mut entries = Vec::new();
        let mut outputs = Vec::new();
        let mut saved = serde_json::Map::new();
        let mut truncated = false;
        let mut blocked = false;
        let mut failure = None;

        for (sequence, action) in actions.into_iter().enumerate() {
            if token.is_cancelled() {
                break;
            }
            if sequence >= options.max_steps {
                info!(run_id = %run_id, max_steps = options.max_steps, skipped = total - sequence, "Step limit reached, truncating run");
                truncated = true;
                break;
            }
            if Instant::now() >= deadline {
                info!(run_id = %run_id, timeout = ?options.timeout, skipped = total - sequence, "Run timeout reached, truncating run");
                truncated = true;
                break;
            }

            let (entry, step) = self
                .attempt(run_id, sequence, action, options, &policy, &token, deadline, &mut saved)
                .await;

            self.audit.append(entry.clone());
            if entry.result.is_success() {
                self.bus.emit(Event::ActionExecuted {
                    run_id,
                    entry: entry.clone(),
                });
            } else {
                self.bus.emit(Event::ActionFailed {
                    run_id,
                    entry: entry.clone(),
                });
            }
            entries.push(entry);

            match step {
                Step::Continue(output) => outputs.extend(output),
                Step::Blocked(f) => {
                    blocked = true;
                    failure = Some(f);
                    break;
                }
                Step::Failed(f) => {
                    failure = Some(f);
                    break;
                }
                Step::DeadlineHit => {
                    info!(run_id = %run_id, "Run timeout hit mid-action, truncating run");
                    truncated = true;
                    break;
                }
                Step::Cancelled => break,
            }
        }

        let still_active = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id)
            .is_some();
        let cancelled = token.is_cancelled();

        if cancelled {
            // `cancel_run` already announced it; a parent cancellation did not.
            if still_active {
                self.bus.emit(Event::RunCancelled { run_id });
            }
            failure.get_or_insert_with(|| Failure::new(FailureKind::Cancelled, "run cancelled"));
            info!(run_id = %run_id, steps = entries.len(), "Executor run cancelled");
        } else if let Some(f) = &failure {
            warn!(run_id = %run_id, blocked, error = %f, "Executor run failed");
            self.bus.emit(Event::RunFailed {
                run_id,
                error: f.to_string(),
                blocked,
            });
        } else {
            info!(run_id = %run_id, steps = entries.len(), truncated, "Executor run completed");
            self.bus.emit(Event::RunCompleted {
                run_id,
                steps: entries.len(),
                truncated,
            });
        }

        ExecutionResult {
            run_id,
            success: failure.is_none(),
            blocked,
            truncated,
            steps: entries.len(),
            error: failure,
            entries,
            outputs,
            saved,
        }
    }

    /// Cancel an active run. Audit entries already written stay.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let token = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id)
            .ok_or(ExecutorError::RunNotActive { run_id })?;
        token.cancel();
        info!(run_id = %run_id, "Executor run cancelled by request");
        self.bus.emit(Event::RunCancelled { run_id });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        run_id: Uuid,
        sequence: usize,
        action: Action,
        options: &ExecutorOptions,
        policy: &DomainPolicy,
        token: &CancellationToken,
        deadline: Instant,
        saved: &mut serde_json::Map<String, serde_json::Value>,
    ) -> (AuditLogEntry, Step) {
        let started = Instant::now();
        let risk = action.risk();
        let consent_required = requires_consent(&action, options.require_consent);
        let mut consent_granted = None;

        let (result, error, step) = 'attempt: {
            if let Action::Navigate { url } = &action
                && let Err(reason) = policy.check(url)
            {
                debug!(run_id = %run_id, url = %url, "Navigation blocked by domain policy");
                let failure = Failure::domain_blocked(reason.clone());
                break 'attempt (AuditResult::DomainBlocked, Some(reason), Step::Blocked(failure));
            }

            if consent_required {
                let granted = self.ask_consent(&action).await;
                consent_granted = Some(granted);
                if !granted {
                    let reason = format!("consent denied for {}", action.describe());
                    let failure = Failure::consent_denied(reason.clone());
                    break 'attempt (AuditResult::ConsentDenied, Some(reason), Step::Blocked(failure));
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => (AuditResult::Cancelled, Some("run cancelled".to_string()), Step::Cancelled),
                outcome = tokio::time::timeout_at(deadline, self.perform(&action, saved)) => match outcome {
                    Err(_) => (AuditResult::Timeout, Some("run timeout reached".to_string()), Step::DeadlineHit),
                    Ok(Ok(output)) => (AuditResult::Success, None, Step::Continue(output)),
                    Ok(Err(e)) => {
                        let message = format!("{e:#}");
                        (AuditResult::Failure, Some(message.clone()), Step::Failed(Failure::execution(message)))
                    }
                },
            }
        };

        let entry = AuditLogEntry {
            run_id,
            sequence,
            risk,
            consent_required,
            consent_granted,
            result,
            error,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            at: Utc::now(),
            action,
        };
        (entry, step)
    }

    async fn ask_consent(&self, action: &Action) -> bool {
        let request = ConsentRequest {
            action_type: action.kind().to_string(),
            description: action.describe(),
            risk: action.risk(),
        };
        match self.consent.check_consent(request).await {
            Ok(decision) => decision.has_consent,
            Err(e) => {
                warn!(error = %e, action = action.kind(), "Consent gate failed, treating as denied");
                false
            }
        }
    }

    async fn perform(
        &self,
        action: &Action,
        saved: &mut serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        match action {
            Action::Click { selector } => self.surface.click(selector).await.map(|_| None),
            Action::Fill { selector, value } => self.surface.fill(selector, value).await.map(|_| None),
            Action::Read { selector } => self
                .surface
                .read(selector)
                .await
                .map(|text| Some(serde_json::Value::String(text))),
            Action::Navigate { url } => self.navigator.navigate(url).await.map(|_| None),
            Action::Extract { selector, attribute } => self
                .surface
                .extract(selector, attribute.as_deref())
                .await
                .map(Some),
            Action::Save { key, value } => {
                saved.insert(key.clone(), value.clone());
                Ok(None)
            }
            Action::Scroll { selector, dy } => self.surface.scroll(selector.as_deref(), *dy).await.map(|_| None),
            Action::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("active_runs", &self.active_runs().len())
            .field("audit_entries", &self.audit.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::events::Topic;
    use crate::executor::consent::{ConsentDecision, StaticConsent};
    use crate::executor::surface::InMemorySurface;

    struct CountingConsent {
        granted: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConsentGate for CountingConsent {
        async fn check_consent(&self, _request: ConsentRequest) -> anyhow::Result<ConsentDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ConsentDecision {
                has_consent: self.granted,
            })
        }
    }

    struct FailingConsent;

    #[async_trait]
    impl ConsentGate for FailingConsent {
        async fn check_consent(&self, _request: ConsentRequest) -> anyhow::Result<ConsentDecision> {
            anyhow::bail!("consent UI unavailable")
        }
    }

    fn page() -> Arc<InMemorySurface> {
        Arc::new(
            InMemorySurface::new()
                .with_element("#title", "Hello")
                .with_element("#go", "Go")
                .with_element("#q", ""),
        )
    }

    fn executor(surface: Arc<InMemorySurface>, consent: Arc<dyn ConsentGate>) -> (AgentExecutor, EventBus) {
        let bus = EventBus::new();
        let exec = AgentExecutor::new(bus.clone(), surface.clone(), surface, consent);
        (exec, bus)
    }

    fn read(sel: &str) -> Action {
        Action::Read { selector: sel.into() }
    }

    fn click(sel: &str) -> Action {
        Action::Click { selector: sel.into() }
    }

    #[tokio::test]
    async fn consent_denied_blocks_before_primitive() {
        let surface = page();
        let consent = Arc::new(CountingConsent {
            granted: false,
            calls: AtomicUsize::new(0),
        });
        let (exec, _) = executor(surface.clone(), consent.clone());

        let result = exec
            .execute(vec![read("#title"), click("#go")], &ExecutorOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.blocked);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].result, AuditResult::Success);
        assert_eq!(result.entries[1].result, AuditResult::ConsentDenied);
        assert_eq!(result.entries[1].consent_granted, Some(false));
        assert_eq!(result.error.unwrap().kind, FailureKind::ConsentDenied);
        assert_eq!(consent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(surface.calls(), vec!["read #title"]);
        assert_eq!(exec.audit_log().entries(result.run_id).len(), 2);
    }

    #[tokio::test]
    async fn consent_gate_error_counts_as_denial() {
        let (exec, _) = executor(page(), Arc::new(FailingConsent));
        let result = exec.execute(vec![click("#go")], &ExecutorOptions::default()).await;
        assert!(result.blocked);
        assert_eq!(result.entries[0].result, AuditResult::ConsentDenied);
    }

    #[tokio::test]
    async fn clicks_need_consent_even_when_not_required() {
        let consent = Arc::new(CountingConsent {
            granted: true,
            calls: AtomicUsize::new(0),
        });
        let (exec, _) = executor(page(), consent.clone());
        let options = ExecutorOptions {
            require_consent: false,
            ..Default::default()
        };
        let result = exec
            .execute(
                vec![
                    Action::Fill {
                        selector: "#q".into(),
                        value: "rust".into(),
                    },
                    click("#go"),
                ],
                &options,
            )
            .await;
        assert!(result.success);
        assert_eq!(consent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.entries[0].consent_granted, None);
        assert_eq!(result.entries[1].consent_granted, Some(true));
    }

    #[tokio::test]
    async fn denied_domain_blocks_without_asking() {
        let consent = Arc::new(CountingConsent {
            granted: true,
            calls: AtomicUsize::new(0),
        });
        let surface = page();
        let (exec, _) = executor(surface.clone(), consent.clone());
        let options = ExecutorOptions {
            denied_domains: vec!["blocked.com".into()],
            ..Default::default()
        };
        let result = exec
            .execute(
                vec![Action::Navigate {
                    url: "https://blocked.com".into(),
                }],
                &options,
            )
            .await;

        assert!(result.blocked);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].result, AuditResult::DomainBlocked);
        assert_eq!(consent.calls.load(Ordering::SeqCst), 0);
        assert_eq!(surface.location(), None);
    }

    #[tokio::test]
    async fn step_limit_truncates_gracefully() {
        let (exec, bus) = executor(page(), Arc::new(StaticConsent::allow_all()));
        let completed = Arc::new(Mutex::new(None));
        {
            let completed = completed.clone();
            bus.on(Topic::RunCompleted, move |e| {
                if let Event::RunCompleted { steps, truncated, .. } = e {
                    *completed.lock().unwrap() = Some((*steps, *truncated));
                }
                Ok(())
            });
        }
        let options = ExecutorOptions {
            max_steps: 5,
            ..Default::default()
        };
        let actions = (0..20).map(|_| Action::Wait { ms: 0 }).collect();
        let result = exec.execute(actions, &options).await;

        assert!(result.success);
        assert!(result.truncated);
        assert_eq!(result.entries.len(), 5);
        assert_eq!(*completed.lock().unwrap(), Some((5, true)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_truncates_mid_action() {
        let (exec, _) = executor(page(), Arc::new(StaticConsent::allow_all()));
        let options = ExecutorOptions {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let result = exec
            .execute(
                vec![Action::Wait { ms: 60 }, Action::Wait { ms: 60 }, Action::Wait { ms: 60 }],
                &options,
            )
            .await;
        assert!(result.truncated);
        assert!(result.success);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[1].result, AuditResult::Timeout);
    }

    #[tokio::test]
    async fn primitive_failure_stops_the_run() {
        let (exec, bus) = executor(page(), Arc::new(StaticConsent::allow_all()));
        let topics = Arc::new(Mutex::new(Vec::new()));
        {
            let topics = topics.clone();
            bus.on_any(move |e| {
                topics.lock().unwrap().push(e.topic());
                Ok(())
            });
        }
        let result = exec
            .execute(vec![read("#missing"), read("#title")], &ExecutorOptions::default())
            .await;

        assert!(!result.success);
        assert!(!result.blocked);
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].result, AuditResult::Failure);
        assert_eq!(
            *topics.lock().unwrap(),
            vec![Topic::RunStarted, Topic::ActionFailed, Topic::RunFailed]
        );
    }

    #[tokio::test]
    async fn outputs_and_saves_are_collected() {
        let (exec, _) = executor(page(), Arc::new(StaticConsent::allow_all()));
        let result = exec
            .execute(
                vec![
                    read("#title"),
                    Action::Extract {
                        selector: "#go".into(),
                        attribute: Some("label".into()),
                    },
                    Action::Save {
                        key: "seen".into(),
                        value: serde_json::json!(true),
                    },
                ],
                &ExecutorOptions::default(),
            )
            .await;
        assert!(result.success);
        assert_eq!(
            result.outputs,
            vec![serde_json::json!("Hello"), serde_json::json!({"label": "Go"})]
        );
        assert_eq!(result.saved.get("seen"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn cancel_run_keeps_recorded_entries() {
        let (exec, bus) = executor(page(), Arc::new(StaticConsent::allow_all()));
        let cancelled = Arc::new(AtomicUsize::new(0));
        {
            let cancelled = cancelled.clone();
            bus.on(Topic::RunCancelled, move |_| {
                cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let runner = exec.clone();
        let handle = tokio::spawn(async move {
            runner
                .execute(
                    vec![read("#title"), Action::Wait { ms: 60_000 }, read("#title")],
                    &ExecutorOptions::default(),
                )
                .await
        });

        let run_id = loop {
            if let Some(id) = exec.active_runs().first().copied()
                && !exec.audit_log().entries(id).is_empty()
            {
                break id;
            }
            tokio::task::yield_now().await;
        };
        exec.cancel_run(run_id).unwrap();
        assert!(matches!(exec.cancel_run(run_id), Err(ExecutorError::RunNotActive { .. })));

        let result = handle.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, FailureKind::Cancelled);
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[1].result, AuditResult::Cancelled);
        assert_eq!(exec.audit_log().entries(run_id).len(), 2);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(exec.active_runs().is_empty());
    }
}
