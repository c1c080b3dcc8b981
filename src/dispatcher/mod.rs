// src/dispatcher/mod.rs
//! Task dispatcher
//!
//! Accepts task specs, runs them on a fixed-size worker pool, and owns the
//! whole task lifecycle.
//!
//! # Flow
//!
//! ```text
//! dispatch(spec)                         (sync, never waits on execution)
//!   ├─ validate + engine preflight
//!   ├─ limit snapshot + governor execution permit
//!   ├─ task record (pending) + resource-key tickets
//!   └─ spawn runner ──→ wait for key predecessors
//!                     ──→ acquire worker slot ──→ running
//!                     ──→ invoke under watchdog (deadline + grace)
//!                     ──→ retry once on transient failure
//!                     ──→ terminal state, history, telemetry
//! ```
//!
//! Engines never see the dispatcher. They get an [`InvocationContext`] with
//! a cancellation token and an event publisher, and hand back a result.

pub(crate) mod keyed;
pub mod task;

pub use task::{TaskError, TaskId, TaskKind, TaskOutput, TaskSnapshot, TaskSpec, TaskState};

use crate::agent::AgentRunner;
use crate::events::{EventBus, EventPublisher, TaskEvent};
use crate::observability::{TelemetryEvent, TelemetryOutcome, TelemetrySink};
use crate::runtime::contract::{Engines, ExecutionStatus, InvocationContext, SessionContext};
use crate::runtime::resource_limiter::{ExecutionPermit, ResourceGovernor, ResourceLimits};
use crate::utils::backoff::Backoff;
use crate::utils::config::DispatcherConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use keyed::{KeyTicket, KeyedSerializer};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use task::TaskRecord;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transient failures get one retry
const MAX_ATTEMPTS: u32 = 2;

struct TaskEntry {
    /// Dispatch order; ids only order to the millisecond
    seq: u64,
    record: TaskRecord,
    cancel: CancellationToken,
    events: EventPublisher,
    state_tx: watch::Sender<TaskState>,
}

struct Inner {
    config: DispatcherConfig,
    engines: Engines,
    governor: Arc<ResourceGovernor>,
    agents: Option<Arc<AgentRunner>>,
    bus: EventBus,
    telemetry: Arc<dyn TelemetrySink>,
    workers: Arc<Semaphore>,
    keys: Arc<KeyedSerializer>,
    tasks: DashMap<TaskId, TaskEntry>,
    next_seq: AtomicU64,

    /// Terminal tasks, newest first
    history: Mutex<VecDeque<TaskSnapshot>>,
}

/// Task dispatcher; cheap to clone
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// What a runner executes, fixed at dispatch
enum Work {
    Engine(crate::runtime::contract::EngineOp),
    Agent(crate::agent::AgentRequest),
}

struct Admission {
    id: TaskId,
    session: SessionContext,
    work: Work,
    limits: ResourceLimits,
    ticket: KeyTicket,
    permit: ExecutionPermit,
    cancel: CancellationToken,
    events: EventPublisher,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        engines: Engines,
        governor: Arc<ResourceGovernor>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let bus = EventBus::new(config.event_buffer);
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        info!(workers = config.workers, history = config.history_capacity, "dispatcher initialized");

        Self {
            inner: Arc::new(Inner {
                config,
                engines,
                governor,
                agents: None,
                bus,
                telemetry,
                workers,
                keys: KeyedSerializer::new(),
                tasks: DashMap::new(),
                next_seq: AtomicU64::new(0),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Enable agent-routed tasks. Must be called before the dispatcher is cloned.
    pub fn with_agents(mut self, agents: Arc<AgentRunner>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.agents = Some(agents),
            None => warn!("dispatcher already shared, agent runner not attached"),
        }
        self
    }

    pub fn engines(&self) -> &Engines {
        &self.inner.engines
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.inner.governor
    }

    pub fn agents(&self) -> Option<&Arc<AgentRunner>> {
        self.inner.agents.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Submit a task. Returns as soon as the task is recorded as pending.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, spec: TaskSpec) -> Result<TaskId> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::Internal("dispatch outside of a tokio runtime".into()))?;

        let (work, limits, keys, input) = self.admit(&spec)?;
        let permit = self.inner.governor.acquire_execution(&spec.session.session_id)?;

        let id = TaskId::new();
        let cancel = CancellationToken::new();
        let events = self.inner.bus.publisher(id);
        let record = TaskRecord::new(id, &spec, input, keys.clone());
        let (state_tx, _) = watch::channel(TaskState::Pending);

        info!(
            task_id = %id,
            operation = %record.snapshot.operation,
            session = %spec.session.session_id,
            "task dispatched"
        );

        // Key registration and insertion happen before the runner exists,
        // so submission order is the order of `dispatch` calls.
        let ticket = self.inner.keys.enqueue(id, &keys);
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.tasks.insert(
            id,
            TaskEntry {
                seq,
                record,
                cancel: cancel.clone(),
                events: events.clone(),
                state_tx,
            },
        );
        events.state(None, TaskState::Pending);
        self.update_active_gauge();

        let admission = Admission {
            id,
            session: spec.session,
            work,
            limits,
            ticket,
            permit,
            cancel,
            events,
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.run(admission).await });
        Ok(id)
    }

    fn admit(&self, spec: &TaskSpec) -> Result<(Work, ResourceLimits, Vec<String>, serde_json::Value)> {
        match &spec.kind {
            TaskKind::Engine(op) => {
                op.validate()?;
                self.inner.engines.preflight(op)?;
                let limits = self.inner.engines.limits_for(op, &spec.session, spec.timeout)?;
                let mut keys = op.resource_keys(&spec.session.workspace);
                keys.sort();
                keys.dedup();
                Ok((Work::Engine(op.clone()), limits, keys, op.summary()))
            }
            TaskKind::Agent(request) => {
                let agents = self.inner.agents.as_ref().ok_or_else(|| {
                    EngineError::InvalidParameters("agent tasks are not enabled".into())
                })?;
                agents.validate(request)?;
                let timeout = spec
                    .timeout
                    .unwrap_or_else(|| Duration::from_secs(agents.config().request_timeout_secs));
                if timeout.is_zero() {
                    return Err(EngineError::InvalidParameters(
                        "timeout must be greater than zero".into(),
                    ));
                }
                let limits = ResourceLimits::default().with_duration(timeout);
                Ok((Work::Agent(request.clone()), limits, Vec::new(), request.summary()))
            }
        }
    }

    /// Current view of a task, live or from history
    pub fn status(&self, id: TaskId) -> Result<TaskSnapshot> {
        if let Some(entry) = self.inner.tasks.get(&id) {
            return Ok(entry.record.snapshot.clone());
        }
        self.inner
            .history
            .lock()
            .iter()
            .find(|snapshot| snapshot.id == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("task '{}'", id)))
    }

    /// Resolves once the task is terminal
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot> {
        let receiver = self.inner.tasks.get(&id).map(|entry| entry.state_tx.subscribe());
        if let Some(mut receiver) = receiver {
            while !receiver.borrow_and_update().is_terminal() {
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        }
        self.status(id)
    }

    /// Cancel a task. Idempotent: a terminal task is returned unchanged.
    ///
    /// A pending task is cancelled immediately. A running task is signalled
    /// and this resolves once its engine has stopped.
    pub async fn cancel(&self, id: TaskId) -> Result<TaskSnapshot> {
        let (state, token) = match self.inner.tasks.get(&id) {
            Some(entry) => (entry.record.state(), entry.cancel.clone()),
            None => return self.status(id),
        };
        if state.is_terminal() {
            return self.status(id);
        }

        info!(task_id = %id, state = %state, "cancelling task");
        token.cancel();
        if state == TaskState::Pending {
            // The runner may have started in between; then it reports the stop.
            self.inner.finish_from(
                id,
                Some(TaskState::Pending),
                TaskState::Cancelled,
                None,
                Some(TaskError::from(&EngineError::Cancelled)),
            );
        }
        self.wait(id).await
    }

    /// Live (non-terminal) tasks in submission order
    pub fn list(&self, session_id: Option<&str>) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<(u64, TaskSnapshot)> = self
            .inner
            .tasks
            .iter()
            .filter(|entry| session_id.map_or(true, |s| entry.record.snapshot.session_id == s))
            .map(|entry| (entry.seq, entry.record.snapshot.clone()))
            .collect();
        tasks.sort_by_key(|(seq, _)| *seq);
        tasks.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Terminal tasks, newest first
    pub fn history(&self, limit: usize) -> Vec<TaskSnapshot> {
        self.inner.history.lock().iter().take(limit).cloned().collect()
    }

    /// Cancel everything still live
    pub async fn shutdown(&self) {
        let live: Vec<TaskId> = self.inner.tasks.iter().map(|entry| *entry.key()).collect();
        info!(tasks = live.len(), "dispatcher shutting down");
        for id in live {
            if let Err(err) = self.cancel(id).await {
                debug!(task_id = %id, error = %err, "cancel during shutdown");
            }
        }
    }

    fn update_active_gauge(&self) {
        metrics::gauge!("sandbox_tasks_active").set(self.inner.tasks.len() as f64);
    }
}

/// How one attempt ended
enum Outcome {
    Completed(TaskOutput),
    /// Engine returned a result that still means failure (timeout status)
    FailedWithOutput(TaskOutput, EngineError),
    CancelledWithOutput(TaskOutput),
    Failed(EngineError),
}

impl Inner {
    async fn run(self: Arc<Self>, admission: Admission) {
        let Admission {
            id,
            session,
            work,
            limits,
            ticket,
            permit,
            cancel,
            events,
        } = admission;

        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            slot = async {
                ticket.ready().await;
                Arc::clone(&self.workers).acquire_owned().await.ok()
            } => slot,
        };
        let Some(_slot) = admitted else {
            self.finish(id, TaskState::Cancelled, None, Some(TaskError::from(&EngineError::Cancelled)));
            return;
        };
        if !self.transition(id, TaskState::Running) {
            return;
        }

        let started = Instant::now();
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.retry_backoff_ms),
            Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(10)),
            2,
        )
        .with_jitter(Duration::from_millis(self.config.retry_jitter_ms));

        let outcome = loop {
            let attempt = self.bump_attempts(id);
            let ctx = InvocationContext {
                task_id: id,
                session: session.clone(),
                limits: limits.clone(),
                events: events.clone(),
                cancel: cancel.clone(),
            };
            let outcome = self.attempt(&work, ctx, &cancel).await;

            match outcome {
                Outcome::Failed(ref err)
                    if err.is_transient() && attempt < MAX_ATTEMPTS && !cancel.is_cancelled() =>
                {
                    let delay = backoff.next_delay();
                    warn!(task_id = %id, attempt, error = %err, ?delay, "transient failure, retrying");
                    metrics::counter!("sandbox_task_retries_total").increment(1);
                    tokio::select! {
                        _ = cancel.cancelled() => break Outcome::Failed(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                outcome => break outcome,
            }
        };

        if let Some(cpu) = outcome_cpu_time(&outcome) {
            self.governor.record_cpu_time(&session.session_id, cpu);
        }

        let (state, output, error) = match outcome {
            Outcome::Completed(output) => (TaskState::Completed, Some(output), None),
            Outcome::FailedWithOutput(output, err) => {
                (TaskState::Failed, Some(output), Some(TaskError::from(&err)))
            }
            Outcome::CancelledWithOutput(output) => (
                TaskState::Cancelled,
                Some(output),
                Some(TaskError::from(&EngineError::Cancelled)),
            ),
            Outcome::Failed(EngineError::Cancelled) => (
                TaskState::Cancelled,
                None,
                Some(TaskError::from(&EngineError::Cancelled)),
            ),
            Outcome::Failed(err) => (TaskState::Failed, None, Some(TaskError::from(&err))),
        };

        if state != TaskState::Completed {
            let released = self.engines.micro.pool().release_held_by(id).await;
            if released > 0 {
                warn!(task_id = %id, released, "released vm leases of aborted task");
            }
        }

        debug!(task_id = %id, state = %state, elapsed = ?started.elapsed(), "task finished");
        drop(permit);
        self.finish(id, state, output, error);
        drop(ticket);
    }

    /// One invocation under the watchdog
    async fn attempt(&self, work: &Work, ctx: InvocationContext, cancel: &CancellationToken) -> Outcome {
        let deadline = ctx.limits.max_duration + self.config.watchdog_grace();
        let grace = self.config.watchdog_grace();
        let execution = self.execute(work, ctx);

        let result = tokio::select! {
            result = tokio::time::timeout(deadline, execution) => match result {
                Ok(result) => result,
                Err(_) => {
                    metrics::counter!("sandbox_watchdog_fired_total").increment(1);
                    warn!(?deadline, "watchdog fired, abandoning engine call");
                    Err(EngineError::Timeout(deadline))
                }
            },
            // An engine that ignores cancellation is dropped after the grace.
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => Err(EngineError::Cancelled),
        };

        match result {
            Ok(output) => {
                let status = match &output {
                    TaskOutput::Engine(engine_output) => engine_output.execution().map(|r| (r.status, r.duration)),
                    TaskOutput::Agent(_) => None,
                };
                // A result that finished before the engine saw the cancel stands.
                match status {
                    Some((ExecutionStatus::TimedOut, duration)) => {
                        Outcome::FailedWithOutput(output, EngineError::Timeout(duration))
                    }
                    Some((ExecutionStatus::Cancelled, _)) => Outcome::CancelledWithOutput(output),
                    _ => Outcome::Completed(output),
                }
            }
            Err(_) if cancel.is_cancelled() => Outcome::Failed(EngineError::Cancelled),
            Err(err) => Outcome::Failed(err),
        }
    }

    async fn execute(&self, work: &Work, ctx: InvocationContext) -> Result<TaskOutput> {
        match work {
            Work::Engine(op) => self.engines.invoke(op.clone(), ctx).await.map(TaskOutput::Engine),
            Work::Agent(request) => {
                let agents = self
                    .agents
                    .as_ref()
                    .ok_or_else(|| EngineError::Internal("agent runner missing".into()))?;
                agents
                    .run(&ctx.session.user_id, request.clone(), &ctx.cancel)
                    .await
                    .map(TaskOutput::Agent)
            }
        }
    }

    fn bump_attempts(&self, id: TaskId) -> u32 {
        match self.tasks.get_mut(&id) {
            Some(mut entry) => {
                entry.record.snapshot.attempts += 1;
                entry.record.snapshot.attempts
            }
            None => MAX_ATTEMPTS,
        }
    }

    /// Non-terminal transition; false if the task is gone or the move is illegal
    fn transition(&self, id: TaskId, next: TaskState) -> bool {
        let (previous, events, tx) = {
            let Some(mut entry) = self.tasks.get_mut(&id) else {
                return false;
            };
            let Some(previous) = entry.record.transition(next) else {
                return false;
            };
            (previous, entry.events.clone(), entry.state_tx.clone())
        };
        tx.send_replace(next);
        events.state(Some(previous), next);
        info!(task_id = %id, from = %previous, to = %next, "task state changed");
        true
    }

    fn finish(
        &self,
        id: TaskId,
        next: TaskState,
        output: Option<TaskOutput>,
        error: Option<TaskError>,
    ) -> Option<TaskSnapshot> {
        self.finish_from(id, None, next, output, error)
    }

    /// Move a task to a terminal state and retire it to history.
    ///
    /// With `expected` set, only applies while the task is still in that
    /// state. Returns `None` when nothing changed.
    fn finish_from(
        &self,
        id: TaskId,
        expected: Option<TaskState>,
        next: TaskState,
        output: Option<TaskOutput>,
        error: Option<TaskError>,
    ) -> Option<TaskSnapshot> {
        let (previous, snapshot, events) = {
            let mut entry = self.tasks.get_mut(&id)?;
            if expected.is_some_and(|state| state != entry.record.state()) {
                return None;
            }
            let previous = entry.record.transition(next)?;
            entry.record.snapshot.output = output;
            entry.record.snapshot.error = error;
            (previous, entry.record.snapshot.clone(), entry.events.clone())
        };

        {
            let mut history = self.history.lock();
            history.push_front(snapshot.clone());
            history.truncate(self.config.history_capacity.max(1));
        }
        // Publish before waking waiters so a woken waiter can drain the event.
        events.state(Some(previous), next);
        if let Some((_, entry)) = self.tasks.remove(&id) {
            entry.state_tx.send_replace(next);
        }
        metrics::gauge!("sandbox_tasks_active").set(self.tasks.len() as f64);

        info!(
            task_id = %id,
            operation = %snapshot.operation,
            state = %next,
            error = snapshot.error.as_ref().map(|e| e.code.as_str()),
            "task finished"
        );

        let duration = match (snapshot.started_at, snapshot.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        self.telemetry.record(TelemetryEvent {
            engine: snapshot
                .engine
                .map(|e| e.as_str().to_string())
                .unwrap_or_else(|| "agent".to_string()),
            operation: snapshot.operation.clone(),
            duration,
            outcome: match next {
                TaskState::Completed => TelemetryOutcome::Completed,
                TaskState::Cancelled => TelemetryOutcome::Cancelled,
                _ => TelemetryOutcome::Failed,
            },
            error_code: snapshot.error.as_ref().map(|e| e.code),
            attempts: snapshot.attempts,
        });
        Some(snapshot)
    }
}

fn outcome_cpu_time(outcome: &Outcome) -> Option<Duration> {
    let output = match outcome {
        Outcome::Completed(output)
        | Outcome::FailedWithOutput(output, _)
        | Outcome::CancelledWithOutput(output) => output,
        Outcome::Failed(_) => return None,
    };
    match output {
        TaskOutput::Engine(engine_output) => engine_output.execution().map(|r| r.usage.cpu_time),
        TaskOutput::Agent(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ledger::InMemoryLedger;
    use crate::agent::llm::{ChatMessage, Completion, CompletionOptions, LlmClient};
    use crate::agent::{AgentKind, AgentRequest};
    use crate::events::EventKind;
    use crate::observability::TracingTelemetry;
    use crate::runtime::contract::{EngineOp, EngineOutput, Payload};
    use crate::runtime::filesystem::{FsOp, FsOutput};
    use crate::runtime::process_manager::ProcessRequest;
    use crate::runtime::workspace::Workspace;
    use crate::utils::errors::ErrorCode;
    use crate::utils::config::{EngineConfig, MicroImageConfig};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Harness {
        _dir: tempfile::TempDir,
        dispatcher: Dispatcher,
        session: SessionContext,
    }

    fn harness_with(configure: impl FnOnce(&mut EngineConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.quotas.max_concurrent = 64;
        config.dispatcher.watchdog_grace_ms = 300;
        config.micro.root = dir.path().join("vms");
        config.micro.images = vec![MicroImageConfig {
            name: "sh".into(),
            command: "sh".into(),
            args: vec![],
            extension: "sh".into(),
            env: HashMap::new(),
        }];
        configure(&mut config);

        let governor = Arc::new(ResourceGovernor::new(config.quotas.clone()));
        let engines = Engines::from_config(&config, Arc::clone(&governor)).unwrap();
        let dispatcher = Dispatcher::new(
            config.dispatcher.clone(),
            engines,
            governor,
            Arc::new(TracingTelemetry),
        );
        let workspace = Workspace::open(dir.path().join("ws")).unwrap();
        Harness {
            _dir: dir,
            dispatcher,
            session: SessionContext::new("user", "session", workspace),
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn write(session: &SessionContext, path: &str, content: &str) -> TaskSpec {
        TaskSpec::engine(
            session.clone(),
            EngineOp::Filesystem(FsOp::Write {
                path: path.into(),
                content: Payload::text(content),
                create_parents: true,
            }),
        )
    }

    fn exec(session: &SessionContext, command: &str, args: &[&str]) -> TaskSpec {
        TaskSpec::engine(
            session.clone(),
            EngineOp::Process(ProcessRequest::new(command, args)),
        )
    }

    #[tokio::test]
    async fn test_dispatch_runs_to_completion() {
        let h = harness();
        let id = h.dispatcher.dispatch(write(&h.session, "a.txt", "hello")).unwrap();
        let snapshot = h.dispatcher.wait(id).await.unwrap();

        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.attempts, 1);
        assert!(snapshot.started_at.is_some() && snapshot.completed_at.is_some());
        assert!(matches!(
            snapshot.output,
            Some(TaskOutput::Engine(EngineOutput::Filesystem(FsOutput::Written { bytes_written: 5, .. })))
        ));
        assert_eq!(h.dispatcher.history(10)[0].id, id);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_task_exists() {
        let h = harness();
        let err = h
            .dispatcher
            .dispatch(write(&h.session, "../escape.txt", "x"))
            .unwrap_err();
        assert!(matches!(err, EngineError::PathEscape(_)));

        let err = h.dispatcher.dispatch(exec(&h.session, "rm", &["-rf", "/"])).unwrap_err();
        assert!(matches!(err, EngineError::CommandNotAllowed(_)));
        assert!(h.dispatcher.list(None).is_empty());
        assert!(h.dispatcher.history(10).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let h = harness();
        assert!(matches!(h.dispatcher.status(TaskId::new()), Err(EngineError::NotFound(_))));
        assert!(matches!(h.dispatcher.cancel(TaskId::new()).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_completed_task_is_idempotent() {
        let h = harness();
        let id = h.dispatcher.dispatch(write(&h.session, "a.txt", "x")).unwrap();
        let done = h.dispatcher.wait(id).await.unwrap();

        let first = h.dispatcher.cancel(id).await.unwrap();
        let second = h.dispatcher.cancel(id).await.unwrap();
        assert_eq!(first, done);
        assert_eq!(second, done);
        assert_eq!(second.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_running_process() {
        let h = harness();
        let id = h.dispatcher.dispatch(exec(&h.session, "sh", &["-c", "sleep 30"])).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.dispatcher.status(id).unwrap().state, TaskState::Running);

        let started = Instant::now();
        let snapshot = h.dispatcher.cancel(id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let h = harness_with(|config| config.dispatcher.workers = 1);
        let blocker = h.dispatcher.dispatch(exec(&h.session, "sh", &["-c", "sleep 30"])).unwrap();
        let queued = h.dispatcher.dispatch(write(&h.session, "never.txt", "x")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.dispatcher.status(queued).unwrap().state, TaskState::Pending);

        let snapshot = h.dispatcher.cancel(queued).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(snapshot.started_at.is_none());
        assert!(!h.session.workspace.root().join("never.txt").exists());

        h.dispatcher.cancel(blocker).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_timeout_fails_with_partial_output() {
        let h = harness();
        let spec = exec(&h.session, "sh", &["-c", "echo started; sleep 60"])
            .with_timeout(Duration::from_secs(1));
        let id = h.dispatcher.dispatch(spec).unwrap();
        let started = Instant::now();
        let snapshot = h.dispatcher.wait(id).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(snapshot.state, TaskState::Failed);
        assert!(snapshot.error.as_ref().unwrap().is_timeout());
        let Some(TaskOutput::Engine(output)) = snapshot.output else {
            panic!("timed out task keeps its output");
        };
        assert_eq!(output.execution().unwrap().stdout_text(), "started\n");
    }

    #[tokio::test]
    async fn test_same_path_writes_complete_in_submission_order() {
        let h = harness();
        let big = "a".repeat(400 * 1024);
        let first = h.dispatcher.dispatch(write(&h.session, "same.txt", &big)).unwrap();
        let second = h.dispatcher.dispatch(write(&h.session, "same.txt", "second")).unwrap();

        let first = h.dispatcher.wait(first).await.unwrap();
        let second = h.dispatcher.wait(second).await.unwrap();
        assert!(first.completed_at.unwrap() <= second.started_at.unwrap());
        let content = std::fs::read_to_string(h.session.workspace.root().join("same.txt")).unwrap();
        assert_eq!(content, "second");
    }

    #[tokio::test]
    async fn test_list_keeps_submission_order() {
        let h = harness_with(|config| config.dispatcher.workers = 1);
        let ids: Vec<TaskId> = (0..12)
            .map(|_| h.dispatcher.dispatch(exec(&h.session, "sh", &["-c", "sleep 30"])).unwrap())
            .collect();

        let listed: Vec<TaskId> = h.dispatcher.list(Some("session")).iter().map(|s| s.id).collect();
        assert_eq!(listed, ids);
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_result_finished_before_cancel_is_completed() {
        let h = harness();
        let ctx = InvocationContext::detached(h.session.clone(), ResourceLimits::default());
        let cancel = ctx.cancel.clone();
        let work = Work::Engine(EngineOp::Filesystem(FsOp::Write {
            path: "raced.txt".into(),
            content: Payload::text("done"),
            create_parents: true,
        }));

        // The first poll starts the write; the cancel lands while it is in flight.
        let attempt = h.dispatcher.inner.attempt(&work, ctx, &cancel);
        tokio::pin!(attempt);
        let first = futures::poll!(attempt.as_mut());
        cancel.cancel();
        let outcome = match first {
            std::task::Poll::Ready(outcome) => outcome,
            std::task::Poll::Pending => attempt.await,
        };
        assert!(matches!(outcome, Outcome::Completed(_)));
        assert!(h.session.workspace.root().join("raced.txt").exists());
    }

    #[tokio::test]
    async fn test_state_transitions_are_published() {
        let h = harness();
        let mut events = h.dispatcher.subscribe();
        let id = h.dispatcher.dispatch(exec(&h.session, "echo", &["hi"])).unwrap();
        h.dispatcher.wait(id).await.unwrap();

        let mut states = Vec::new();
        let mut stdout = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.task_id, id);
            match event.kind {
                EventKind::StateChanged { to, .. } => states.push(to),
                EventKind::Output { data, .. } => stdout.extend_from_slice(&data),
                EventKind::Message { .. } => {}
            }
        }
        assert_eq!(states, vec![TaskState::Pending, TaskState::Running, TaskState::Completed]);
        assert_eq!(stdout, b"hi\n");
    }

    #[tokio::test]
    async fn test_quota_rejects_at_dispatch() {
        let h = harness_with(|config| config.quotas.max_concurrent = 1);
        let running = h.dispatcher.dispatch(exec(&h.session, "sh", &["-c", "sleep 30"])).unwrap();
        let err = h.dispatcher.dispatch(exec(&h.session, "echo", &["x"])).unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded(_)));

        h.dispatcher.cancel(running).await.unwrap();
        assert!(h.dispatcher.dispatch(exec(&h.session, "echo", &["x"])).is_ok());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let h = harness_with(|config| {
            config.micro.images[0].command = "definitely-not-a-runtime".into();
        });
        let spec = TaskSpec::engine(
            h.session.clone(),
            EngineOp::MicroVm(crate::runtime::micro_vm::MicroOp::Run {
                image: "sh".into(),
                code: "echo".into(),
                timeout_ms: None,
            }),
        );
        let id = h.dispatcher.dispatch(spec).unwrap();
        let snapshot = h.dispatcher.wait(id).await.unwrap();

        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.error.unwrap().code, ErrorCode::ExecutionFailed);
        assert_eq!(h.dispatcher.engines().micro.pool().total_instances(), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let h = harness_with(|config| config.dispatcher.history_capacity = 3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = h
                .dispatcher
                .dispatch(write(&h.session, &format!("f{}.txt", i), "x"))
                .unwrap();
            h.dispatcher.wait(id).await.unwrap();
            ids.push(id);
        }
        let history: Vec<TaskId> = h.dispatcher.history(10).iter().map(|s| s.id).collect();
        assert_eq!(history, vec![ids[4], ids[3], ids[2]]);
        assert!(matches!(h.dispatcher.status(ids[0]), Err(EngineError::NotFound(_))));
    }

    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<Completion> {
            Ok(Completion {
                text: r#"{"summary": "looks fine", "insights": ["ok"], "actions": []}"#.into(),
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }

        fn description(&self) -> String {
            "echo".into()
        }
    }

    #[tokio::test]
    async fn test_agent_task_routes_through_dispatcher() {
        let h = harness();
        let ledger = Arc::new(InMemoryLedger::new(10_000));
        let runner = Arc::new(AgentRunner::new(
            crate::utils::config::AgentConfig::default(),
            Arc::new(EchoLlm),
            ledger.clone(),
        ));
        let dispatcher = h.dispatcher.with_agents(runner);

        let spec = TaskSpec::agent(h.session.clone(), AgentRequest::new(AgentKind::Code, "review main.rs"));
        let id = dispatcher.dispatch(spec).unwrap();
        let snapshot = dispatcher.wait(id).await.unwrap();

        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.operation, "agent.code");
        let Some(TaskOutput::Agent(outcome)) = snapshot.output else {
            panic!("expected an agent outcome");
        };
        assert_eq!(outcome.summary, "looks fine");
        assert_eq!(ledger.available("user"), 10_000 - 15);
    }

    #[tokio::test]
    async fn test_agent_tasks_disabled_without_runner() {
        let h = harness();
        let spec = TaskSpec::agent(h.session.clone(), AgentRequest::new(AgentKind::Doc, "write docs"));
        assert!(matches!(
            h.dispatcher.dispatch(spec),
            Err(EngineError::InvalidParameters(_))
        ));
    }
}
