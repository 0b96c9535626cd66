//! The event runner.
//!
//! A bounded queue feeds `workers` loops. Each loop takes one event at a
//! time and runs it to completion: hooks, orchestration, then either routing
//! the successor named by the output state or handing the failure to the
//! error router. Follow-up events go back into the same queue.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weave_core::config::{CircuitBreakerConfig, RunnerConfig, WeaveConfig};
use weave_core::context::RunContext;
use weave_core::error::{Result, WeaveError};
use weave_core::event::EventBus;
use weave_core::failure::{ErrorEventData, RecoveryAction};
use weave_core::hooks::{CallbackArgs, CallbackRegistry, HookPoint};
use weave_core::traits::AgentHandler;
use weave_core::types::{keys, AgentResult, Event, RuntimeEvent, State};
use weave_resilience::{CircuitBreaker, ErrorRouter, Retrier};

use crate::dispatch::Dispatcher;
use crate::graph::{ValidationResult, ValidatorLimits, WorkflowGraph, WorkflowValidator};
use crate::orchestration::{route, Dispatched, Failure, Orchestrator};
use crate::registry::AgentRegistry;
use crate::trace::{register_trace_hooks, InMemoryTraceLogger, TraceEntry, TraceLogger};

/// Assembles a [`Runner`] from explicitly injected collaborators.
pub struct RunnerBuilder {
    config: RunnerConfig,
    orchestrator: Orchestrator,
    router: ErrorRouter,
    retrier: Option<Retrier>,
    breaker_config: Option<CircuitBreakerConfig>,
    breakers: Vec<(String, Arc<CircuitBreaker>)>,
    validator: WorkflowValidator,
    graph: Option<WorkflowGraph>,
    callbacks: Option<Arc<CallbackRegistry>>,
    bus: Option<Arc<EventBus>>,
    tracing: bool,
}

impl RunnerBuilder {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            orchestrator: Orchestrator::default(),
            router: ErrorRouter::default(),
            retrier: None,
            breaker_config: None,
            breakers: Vec::new(),
            validator: WorkflowValidator::default(),
            graph: None,
            callbacks: None,
            bus: None,
            tracing: true,
        }
    }

    pub fn with_orchestration(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_error_router(mut self, router: ErrorRouter) -> Self {
        self.router = router;
        self
    }

    /// Retry retryable agent failures in place before they reach the router.
    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = Some(retrier);
        self
    }

    /// Give every agent registered from now on its own breaker.
    pub fn with_circuit_breakers(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = Some(config);
        self
    }

    /// Guard one agent with a specific breaker.
    pub fn with_circuit_breaker(mut self, agent_id: impl Into<String>, breaker: Arc<CircuitBreaker>) -> Self {
        self.breakers.push((agent_id.into(), breaker));
        self
    }

    pub fn with_validator(mut self, validator: WorkflowValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Validate `graph` on start.
    pub fn with_graph(mut self, graph: WorkflowGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<CallbackRegistry>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Record every hook invocation for [`Runner::dump_trace`]. On by default.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    pub fn build(self) -> Runner {
        let registry = Arc::new(AgentRegistry::new());
        let callbacks = self.callbacks.unwrap_or_default();
        let bus = self.bus.unwrap_or_default();

        let mut dispatcher = Dispatcher::new(registry, Arc::clone(&callbacks), Arc::clone(&bus))
            .with_agent_timeout(self.config.agent_timeout())
            .with_callback_timeout(self.config.callback_timeout());
        if let Some(retrier) = self.retrier {
            dispatcher = dispatcher.with_retrier(retrier);
        }
        for (agent_id, breaker) in self.breakers {
            dispatcher.set_breaker(agent_id, breaker);
        }

        let orchestrator = self
            .orchestrator
            .with_excluded(self.router.config().handler_names());

        let trace = if self.tracing {
            let logger = Arc::new(InMemoryTraceLogger::new());
            match register_trace_hooks(&callbacks, logger.clone()) {
                Ok(()) => Some(logger),
                Err(e) => {
                    warn!(error = %e, "Trace hooks not registered");
                    None
                }
            }
        } else {
            None
        };

        Runner {
            inner: Arc::new(Inner {
                terminated: Mutex::new(TerminatedSessions::new(self.config.max_terminated_sessions)),
                config: self.config,
                dispatcher,
                orchestrator,
                router: self.router,
                validator: self.validator,
                graph: self.graph,
                breaker_config: self.breaker_config,
                bus,
                trace,
                lifecycle: Mutex::new(Lifecycle::default()),
                accepting: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
                processed: AtomicU64::new(0),
            }),
        }
    }
}

/// Handle to a running (or runnable) workflow. Cheap to clone.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

struct Inner {
    config: RunnerConfig,
    dispatcher: Dispatcher,
    orchestrator: Orchestrator,
    router: ErrorRouter,
    validator: WorkflowValidator,
    graph: Option<WorkflowGraph>,
    breaker_config: Option<CircuitBreakerConfig>,
    bus: Arc<EventBus>,
    trace: Option<Arc<InMemoryTraceLogger>>,
    lifecycle: Mutex<Lifecycle>,
    accepting: AtomicBool,
    /// Accepted events not yet fully processed, follow-ups included.
    pending: AtomicUsize,
    drained: Notify,
    processed: AtomicU64,
    terminated: Mutex<TerminatedSessions>,
}

/// Terminated session ids, oldest evicted once `cap` is reached.
struct TerminatedSessions {
    order: VecDeque<String>,
    ids: HashSet<String>,
    cap: usize,
}

impl TerminatedSessions {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            cap: cap.max(1),
        }
    }

    fn contains(&self, session_id: &str) -> bool {
        self.ids.contains(session_id)
    }

    fn insert(&mut self, session_id: &str) -> bool {
        if !self.ids.insert(session_id.to_string()) {
            return false;
        }
        self.order.push_back(session_id.to_string());
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn remove(&mut self, session_id: &str) -> bool {
        if !self.ids.remove(session_id) {
            return false;
        }
        self.order.retain(|id| id != session_id);
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    tx: Option<mpsc::Sender<Event>>,
    cancel: Option<CancellationToken>,
    workers: Vec<JoinHandle<()>>,
}

impl Runner {
    pub fn builder(config: RunnerConfig) -> RunnerBuilder {
        RunnerBuilder::new(config)
    }

    /// Wire a runner from a loaded configuration.
    pub fn from_config(config: &WeaveConfig) -> Result<Self> {
        config.validate()?;

        let limits = ValidatorLimits {
            max_parallel: config.orchestration.max_concurrency.max(1),
            error_handler_name: config.error_router.error_handler_name.clone(),
            ..ValidatorLimits::default()
        };
        let mut builder = RunnerBuilder::new(config.runner.clone())
            .with_orchestration(Orchestrator::from_config(&config.orchestration)?)
            .with_error_router(ErrorRouter::new(config.error_router.clone()))
            .with_validator(WorkflowValidator::new(limits));
        if config.error_router.enable_retries {
            builder = builder.with_retrier(Retrier::new(config.retry.clone()));
        }
        if config.error_router.enable_circuit_breaker {
            builder = builder.with_circuit_breakers(config.circuit_breaker.clone());
        }
        Ok(builder.build())
    }

    pub fn register_agent(&self, name: impl Into<String>, handler: impl AgentHandler) -> Result<()> {
        self.register_shared(name, Arc::new(handler))
    }

    /// Register a handler that is also held elsewhere.
    pub fn register_shared(&self, name: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Result<()> {
        let name = name.into();
        let inner = &self.inner;
        inner.dispatcher.registry().register(name.clone(), handler)?;

        if let Some(config) = &inner.breaker_config {
            if !inner.dispatcher.has_breaker(&name) {
                let bus = Arc::clone(&inner.bus);
                let breaker = CircuitBreaker::new(name.clone(), config.clone()).with_state_change(
                    move |breaker, from, to| {
                        bus.publish(RuntimeEvent::BreakerStateChanged {
                            name: breaker.to_string(),
                            from: from.to_string(),
                            to: to.to_string(),
                        });
                    },
                );
                inner.dispatcher.set_breaker(name.clone(), Arc::new(breaker));
            }
        }

        info!(agent_id = %name, "Agent registered");
        Ok(())
    }

    pub fn register_callback<F, Fut>(&self, hook: HookPoint, id: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(RunContext, CallbackArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<State>>> + Send + 'static,
    {
        self.inner.dispatcher.callbacks().register(hook, id, f)
    }

    pub fn unregister_callback(&self, hook: HookPoint, id: &str) -> bool {
        self.inner.dispatcher.callbacks().unregister(hook, id)
    }

    /// Queue an event. Never blocks: a full queue is reported as `QueueFull`.
    pub fn emit(&self, event: Event) -> Result<()> {
        let inner = &self.inner;
        // Count first so a concurrent stop() either sees this event or we see it stopping.
        inner.pending.fetch_add(1, Ordering::SeqCst);
        if !inner.accepting.load(Ordering::SeqCst) {
            inner.release();
            return Err(WeaveError::NotStarted);
        }
        let Some(tx) = inner.sender() else {
            inner.release();
            return Err(WeaveError::NotStarted);
        };

        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                inner.release();
                Err(WeaveError::QueueFull(inner.config.queue_size))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.release();
                Err(WeaveError::NotStarted)
            }
        }
    }

    /// Validate everything, then spawn the workers.
    ///
    /// No worker runs if validation fails.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        {
            let mut lifecycle = inner.lifecycle();
            if lifecycle.started {
                return Err(WeaveError::AlreadyStarted);
            }
            lifecycle.started = true;
        }

        if let Err(e) = inner.validate() {
            inner.lifecycle().started = false;
            error!(error = %e, "Runner validation failed");
            return Err(e);
        }

        let workers = inner.config.workers;
        let (tx, rx) = mpsc::channel(inner.config.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = cancel.child_token();

        let handles = (0..workers)
            .map(|id| {
                let inner = Arc::clone(inner);
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(async move { inner.work(id, rx, cancel).await })
            })
            .collect();

        {
            let mut lifecycle = inner.lifecycle();
            lifecycle.tx = Some(tx);
            lifecycle.cancel = Some(cancel);
            lifecycle.workers = handles;
        }
        inner.accepting.store(true, Ordering::SeqCst);

        info!(
            workers,
            queue_size = inner.config.queue_size,
            mode = %inner.orchestrator.mode(),
            agents = inner.dispatcher.registry().len(),
            "Runner started"
        );
        inner.bus.publish(RuntimeEvent::RunnerStarted { workers });
        Ok(())
    }

    /// Stop accepting events, wait for everything accepted so far (and every
    /// follow-up it causes) to finish, then shut the workers down.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let cancel = {
            let lifecycle = inner.lifecycle();
            if !lifecycle.started {
                return;
            }
            lifecycle.cancel.clone()
        };

        inner.accepting.store(false, Ordering::SeqCst);
        info!(pending = inner.pending.load(Ordering::SeqCst), "Runner stopping");

        if let Some(cancel) = &cancel {
            inner.wait_drained(cancel).await;
            cancel.cancel();
        }

        let workers = {
            let mut lifecycle = inner.lifecycle();
            lifecycle.tx = None;
            lifecycle.cancel = None;
            lifecycle.started = false;
            std::mem::take(&mut lifecycle.workers)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }
        inner.pending.store(0, Ordering::SeqCst);

        let processed = inner.processed.load(Ordering::SeqCst);
        info!(processed, "Runner stopped");
        inner.bus.publish(RuntimeEvent::RunnerStopped { processed });
    }

    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Events fully processed since the runner was built.
    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::SeqCst)
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        self.inner.dispatcher.callbacks()
    }

    pub fn registry(&self) -> &AgentRegistry {
        self.inner.dispatcher.registry()
    }

    pub fn breaker(&self, agent_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.dispatcher.breaker(agent_id)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    /// Hook trace of one session, in recording order. Empty when tracing is off.
    pub fn dump_trace(&self, session_id: &str) -> Vec<TraceEntry> {
        self.inner
            .trace
            .as_ref()
            .map(|logger| logger.trace(session_id))
            .unwrap_or_default()
    }

    /// Sessions that have a recorded trace.
    pub fn traced_sessions(&self) -> Vec<String> {
        self.inner
            .trace
            .as_ref()
            .map(|logger| logger.sessions())
            .unwrap_or_default()
    }

    pub fn is_terminated(&self, session_id: &str) -> bool {
        self.inner.is_terminated(session_id)
    }

    /// Accept events for `session_id` again. Returns false if it was not terminated.
    pub fn forget_session(&self, session_id: &str) -> bool {
        self.inner
            .terminated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
    }

    /// Terminated sessions currently remembered.
    pub fn terminated_sessions(&self) -> usize {
        self.inner
            .terminated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Run every static check `start` runs, without starting.
    pub fn validate(&self) -> Result<()> {
        self.inner.validate()
    }
}

/// What the worker owes an event once its handlers have run.
enum FollowUp {
    None,
    Route { agent_id: String, result: AgentResult },
    Retry(Box<ErrorEventData>),
    RouteFailure { agent_id: String, error: WeaveError },
    Unhandled { agent_id: String, error: WeaveError },
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        self.lifecycle().tx.clone()
    }

    fn release(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self, cancel: &CancellationToken) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    fn is_terminated(&self, session_id: &str) -> bool {
        self.terminated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    fn terminate(&self, session_id: &str, reason: &str) {
        let inserted = self
            .terminated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id);
        if inserted {
            info!(session_id = %session_id, reason = %reason, "Chain terminated");
            self.bus.publish(RuntimeEvent::ChainTerminated {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    fn validate(&self) -> Result<()> {
        if self.config.queue_size == 0 || self.config.workers == 0 {
            return Err(WeaveError::Config(
                "runner.queue_size and runner.workers must be at least 1".into(),
            ));
        }

        let names = self.dispatcher.registry().names();
        let mut problems = Vec::new();
        let plan = self
            .validator
            .validate_orchestration(&names, self.orchestrator.plan());
        collect_problems(&plan, &mut problems);
        if let Some(graph) = &self.graph {
            collect_problems(&self.validator.validate_graph(graph), &mut problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(WeaveError::InvalidWorkflow(problems.join("; ")))
        }
    }

    async fn work(
        self: Arc<Self>,
        id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
        cancel: CancellationToken,
    ) {
        debug!(worker = id, "Worker started");
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    event = rx.recv() => event,
                }
            };
            let Some(event) = next else {
                break;
            };
            self.process(event, &cancel).await;
            self.processed.fetch_add(1, Ordering::SeqCst);
            self.release();
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Queue a follow-up. Waits for capacity in the background when full.
    fn enqueue(self: &Arc<Self>, event: Event) {
        let Some(tx) = self.sender() else {
            warn!(event_id = %event.id(), "Runner stopped, follow-up event dropped");
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(event_id = %event.id(), "Queue full, follow-up waiting for capacity");
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if tx.send(event).await.is_err() {
                        inner.release();
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(event_id = %event.id(), "Queue closed, follow-up event dropped");
                self.release();
            }
        }
    }

    async fn process(self: &Arc<Self>, event: Event, cancel: &CancellationToken) {
        let session_id = event
            .session_id()
            .map(String::from)
            .unwrap_or_else(|| event.id().to_string());

        if self.is_terminated(&session_id) {
            debug!(event_id = %event.id(), session_id = %session_id, "Session terminated, dropping event");
            self.bus.publish(RuntimeEvent::EventDropped {
                event_id: event.id().to_string(),
                reason: format!("session {} terminated", session_id),
            });
            return;
        }

        let ctx = RunContext::new(session_id.clone(), cancel.child_token());
        let mut state = State::seeded_from(&event);
        state.set_meta(keys::SESSION_ID, session_id.clone());
        let error_data = ErrorEventData::from_event(&event);

        let target = route::target_of(&event)
            .map(String::from)
            .unwrap_or_else(|| self.orchestrator.mode().to_string());
        debug!(event_id = %event.id(), session_id = %session_id, target = %target, "Dispatching event");
        self.bus.publish(RuntimeEvent::EventDispatched {
            event_id: event.id().to_string(),
            session_id: session_id.clone(),
            target,
        });

        let before = CallbackArgs::new(HookPoint::BeforeEventHandling, event.clone(), state.clone());
        let state = match self.dispatcher.run_hook(&ctx, before).await {
            Ok(state) => state,
            Err(e) => {
                warn!(event_id = %event.id(), error = %e, "BeforeEventHandling failed, skipping event");
                self.bus.publish(RuntimeEvent::EventDropped {
                    event_id: event.id().to_string(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        // Error events always go straight to the handler they are addressed to.
        let outcome = match &error_data {
            Some(_) => route::run(&self.dispatcher, &ctx, &event, state.clone()).await,
            None => {
                self.orchestrator
                    .dispatch(&self.dispatcher, &ctx, &event, state.clone())
                    .await
            }
        };

        if let Some(data) = &error_data {
            if data.recovery_action == RecoveryAction::Terminate {
                self.terminate(&session_id, &data.error_message);
            }
        }

        let mut after = CallbackArgs::new(HookPoint::AfterEventHandling, event.clone(), state);
        let follow_up = match outcome {
            Ok(Dispatched { agent_id, result }) => {
                if let Some(soft) = &result.error {
                    info!(agent_id = %agent_id, error = %soft, "Agent reported a soft error");
                }
                after = after.with_agent(agent_id.clone()).with_result(result.clone());
                after.state = result.output_state.clone();
                let wants_retry = result.metadata.get(keys::RECOVERY_ACTION).map(String::as_str)
                    == Some(RecoveryAction::Retry.as_str());
                match error_data {
                    Some(data) if wants_retry => FollowUp::Retry(Box::new(data)),
                    _ if result.route().is_some() => FollowUp::Route { agent_id, result },
                    _ => FollowUp::None,
                }
            }
            Err(Failure { agent_id, error }) => {
                after = after.with_agent(agent_id.clone()).with_error(error.to_string());
                if error_data.is_some() {
                    FollowUp::Unhandled { agent_id, error }
                } else {
                    FollowUp::RouteFailure { agent_id, error }
                }
            }
        };

        if let Err(e) = self.dispatcher.run_hook(&ctx, after).await {
            warn!(event_id = %event.id(), error = %e, "AfterEventHandling failed");
        }

        match follow_up {
            FollowUp::None => {}
            FollowUp::Route { agent_id, result } => {
                self.follow_route(&session_id, &agent_id, &event, result)
            }
            FollowUp::Retry(data) => self.schedule_retry(&session_id, &data, cancel),
            FollowUp::RouteFailure { agent_id, error } => {
                self.route_failure(&event, &agent_id, &error)
            }
            FollowUp::Unhandled { agent_id, error } => {
                error!(
                    event_id = %event.id(),
                    agent_id = %agent_id,
                    error = %error,
                    "Recovery handler failed"
                );
                self.bus.publish(RuntimeEvent::ErrorUnhandled {
                    event_id: event.id().to_string(),
                    agent_id,
                    error: error.to_string(),
                });
            }
        }
    }

    /// Emit the successor named by `result`'s `route`.
    fn follow_route(self: &Arc<Self>, session_id: &str, agent_id: &str, event: &Event, result: AgentResult) {
        let Some(next) = result.route().map(String::from) else {
            return;
        };
        if self.is_terminated(session_id) {
            debug!(session_id = %session_id, next = %next, "Session terminated, not routing");
            return;
        }

        let hops = event
            .get_meta(keys::ROUTE_HOPS)
            .and_then(|h| h.trim().parse::<u32>().ok())
            .unwrap_or(0)
            .saturating_add(1);
        if hops > self.config.max_route_hops {
            warn!(
                agent_id = %agent_id,
                next = %next,
                max_route_hops = self.config.max_route_hops,
                "Route hop limit reached, dropping successor"
            );
            self.bus.publish(RuntimeEvent::EventDropped {
                event_id: event.id().to_string(),
                reason: format!("route hop limit {} reached", self.config.max_route_hops),
            });
            return;
        }

        let (data, mut meta) = result.output_state.into_parts();
        meta.remove(keys::RETRY_COUNT);
        meta.insert(keys::SESSION_ID.to_string(), session_id.to_string());
        meta.insert(keys::STATUS.to_string(), keys::STATUS_SUCCESS.to_string());
        meta.insert(keys::ROUTE_HOPS.to_string(), hops.to_string());

        debug!(from = %agent_id, to = %next, hops, "Routing to successor");
        let successor = Event::new(next, data, meta).with_source(agent_id);
        self.enqueue(successor);
    }

    /// Resubmit the original event of a failure after the retry delay.
    fn schedule_retry(self: &Arc<Self>, session_id: &str, data: &ErrorEventData, cancel: &CancellationToken) {
        let config = self.router.config();
        let original = &data.original_event;
        let count = data.retry_count;

        if !config.enable_retries {
            debug!(event_id = %original.id(), "Retries disabled, ignoring retry request");
            return;
        }
        if count >= config.max_retries {
            warn!(
                event_id = %original.id(),
                retry_count = count,
                max_retries = config.max_retries,
                "Retry budget exhausted"
            );
            return;
        }
        if self.is_terminated(session_id) {
            debug!(session_id = %session_id, "Session terminated, not retrying");
            return;
        }

        let mut retry = self.router.resubmit(data);
        if retry.session_id().is_none() {
            retry = retry.with_session(data.session_id.clone());
        }
        info!(
            event_id = %retry.id(),
            target = %retry.target_agent_id(),
            retry_count = count + 1,
            delay_ms = config.retry_delay_ms,
            "Retry scheduled"
        );
        self.bus.publish(RuntimeEvent::RetryScheduled {
            event_id: retry.id().to_string(),
            target: route::target_of(&retry).unwrap_or_default().to_string(),
            retry_count: count + 1,
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        let cancel = cancel.clone();
        let delay = config.retry_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => inner.enqueue(retry),
                _ = cancel.cancelled() => {}
            }
            inner.release();
        });
    }

    /// Turn a hard failure into an error event for a registered recovery handler.
    fn route_failure(self: &Arc<Self>, event: &Event, agent_id: &str, err: &WeaveError) {
        let data = self.router.build_error_data(event, agent_id, err);
        let preferred = self.router.select_handler(data.severity, data.error_code);
        let fallback = &self.router.config().error_handler_name;
        let registry = self.dispatcher.registry();

        let handler = if registry.contains(&preferred) {
            Some(preferred)
        } else if registry.contains(fallback) {
            debug!(preferred = %preferred, fallback = %fallback, "Preferred handler missing, using default");
            Some(fallback.clone())
        } else {
            None
        };

        let Some(handler) = handler else {
            error!(
                event_id = %event.id(),
                agent_id = %agent_id,
                error_code = %data.error_code,
                error = %err,
                "No recovery handler registered"
            );
            self.bus.publish(RuntimeEvent::ErrorUnhandled {
                event_id: event.id().to_string(),
                agent_id: agent_id.to_string(),
                error: err.to_string(),
            });
            if data.recovery_action == RecoveryAction::Terminate {
                self.terminate(&data.session_id, &data.error_message);
            }
            return;
        };

        let error_event = self.router.error_event(&data, &handler);
        warn!(
            agent_id = %agent_id,
            handler = %handler,
            error_code = %data.error_code,
            severity = %data.severity,
            recovery_action = %data.recovery_action,
            "Routing failure to recovery handler"
        );
        self.bus.publish(RuntimeEvent::ErrorRouted {
            event_id: error_event.id().to_string(),
            handler,
            error_code: data.error_code.to_string(),
            severity: data.severity.to_string(),
            recovery_action: data.recovery_action.to_string(),
        });
        self.enqueue(error_event);
    }
}

fn collect_problems(result: &ValidationResult, problems: &mut Vec<String>) {
    for warning in &result.warnings {
        warn!(kind = %warning.kind, component = %warning.component, "{}", warning.message);
    }
    if !result.is_valid {
        problems.push(result.render_errors());
    }
}
