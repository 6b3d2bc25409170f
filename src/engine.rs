//! The engine: one explicit handle owning every component.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::enforcement::{ExecutionGuard, RecoveryReport, Watchdog, WatchdogHandle, recover};
use crate::error::Result;
use crate::events::EventBus;
use crate::executor::{
    AgentExecutor, ConsentGate, ConsentLedger, InMemorySurface, Navigator, StaticConsent, Surface,
};
use crate::orchestrator::AgentOrchestrator;
use crate::runtime::{AgentRuntime, BrowserActionsTool, InMemoryMemoryStore, MemoryStore};
use crate::store::SnapshotStore;
use crate::task::TaskRegistry;
use crate::worker::{WorkerBridge, WorkerHandler, WorkerPool};

/// External collaborators the engine is wired to.
pub struct EngineDeps {
    pub consent: Arc<dyn ConsentGate>,
    pub memory: Arc<dyn MemoryStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub surface: Arc<dyn Surface>,
    pub navigator: Arc<dyn Navigator>,
    /// Runs heavy tasks. Without one, heavy task types fail as unavailable.
    pub worker_handler: Option<Arc<dyn WorkerHandler>>,
    pub clock: Arc<dyn Clock>,
}

impl EngineDeps {
    /// Defaults around `snapshot_store`: consent always denied, in-memory
    /// memory store and page surface, no worker handler, system clock.
    pub fn new(snapshot_store: Arc<dyn SnapshotStore>) -> Self {
        let surface = Arc::new(InMemorySurface::new());
        Self {
            consent: Arc::new(StaticConsent::deny_all()),
            memory: Arc::new(InMemoryMemoryStore::new()),
            snapshot_store,
            surface: surface.clone(),
            navigator: surface,
            worker_handler: None,
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Engine {
    config: CoreConfig,
    bus: EventBus,
    tasks: TaskRegistry,
    bridge: Option<Arc<WorkerBridge>>,
    executor: AgentExecutor,
    consent: ConsentLedger,
    guard: ExecutionGuard,
    runtime: AgentRuntime,
    orchestrator: AgentOrchestrator,
    snapshot_store: Arc<dyn SnapshotStore>,
    watchdog: Mutex<Option<WatchdogHandle>>,
}

impl Engine {
    /// Wire up every component. Nothing runs until [`start`](Self::start).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: CoreConfig, deps: EngineDeps) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::new();

        let bridge = match deps.worker_handler {
            Some(handler) if config.worker.pool_size > 0 => {
                let pool = WorkerPool::spawn(config.worker.pool_size, handler)?;
                Some(Arc::new(WorkerBridge::new(pool, bus.clone(), config.worker.call_timeout)))
            }
            _ => None,
        };

        let tasks = match &bridge {
            Some(bridge) => TaskRegistry::with_worker_bridge(
                bus.clone(),
                deps.snapshot_store.clone(),
                deps.clock.clone(),
                bridge.clone(),
            ),
            None => TaskRegistry::new(bus.clone(), deps.snapshot_store.clone(), deps.clock.clone()),
        };

        let guard = ExecutionGuard::new(tasks.clone(), config.guard_mode);
        let consent = ConsentLedger::with_memory(deps.consent, deps.clock.clone(), deps.memory.clone());
        let executor = AgentExecutor::new(bus.clone(), deps.surface, deps.navigator, Arc::new(consent.clone()));
        let runtime = AgentRuntime::new(tasks.clone(), deps.memory, guard.clone(), config.runtime.clone());
        runtime.register_tool(Arc::new(BrowserActionsTool::new(
            executor.clone(),
            config.executor.clone(),
        )))?;
        let orchestrator =
            AgentOrchestrator::new(runtime.clone(), bus.clone(), deps.clock, config.orchestrator.clone());

        info!(
            workers = bridge.as_ref().map_or(0, |b| b.pool().size()),
            max_concurrent_jobs = config.orchestrator.max_concurrent_jobs,
            guard_mode = ?config.guard_mode,
            "Engine initialized"
        );

        Ok(Self {
            config,
            bus,
            tasks,
            bridge,
            executor,
            consent,
            guard,
            runtime,
            orchestrator,
            snapshot_store: deps.snapshot_store,
            watchdog: Mutex::new(None),
        })
    }

    /// Recover the previous snapshot and start the watchdog. Calling it again
    /// while running is a no-op that returns an empty report.
    pub fn start(&self) -> RecoveryReport {
        let mut watchdog = self.watchdog.lock().unwrap_or_else(|e| e.into_inner());
        if watchdog.is_some() {
            return RecoveryReport::default();
        }

        let report = match recover(&self.tasks, self.snapshot_store.as_ref()) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Task snapshot unreadable, starting without it");
                RecoveryReport::default()
            }
        };

        *watchdog = Some(Watchdog::new(self.tasks.clone(), self.config.watchdog.clone()).start());
        info!(
            recovered = report.imported,
            interrupted = report.interrupted.len(),
            "Engine started"
        );
        report
    }

    /// Stop the watchdog (taking a final backup) and the worker pool.
    pub async fn shutdown(&self) {
        let watchdog = self.watchdog.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = watchdog {
            handle.stop().await;
        }
        if let Some(bridge) = &self.bridge {
            bridge.shutdown();
        }
        info!("Engine shut down");
    }

    pub fn is_running(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|w| w.is_running())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn worker_bridge(&self) -> Option<&Arc<WorkerBridge>> {
        self.bridge.as_ref()
    }

    pub fn executor(&self) -> &AgentExecutor {
        &self.executor
    }

    /// Every consent decision made for this engine's actions.
    pub fn consent_ledger(&self) -> &ConsentLedger {
        &self.consent
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn orchestrator(&self) -> &AgentOrchestrator {
        &self.orchestrator
    }
}
