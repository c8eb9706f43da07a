use crate::config::RuntimeConfig;
use crate::error::{RegistryError, RuntimeError};
use crate::graph::emission_cycles;
use crate::loader::{FsStepSource, StepSource};
use crate::registry::{HandlerRegistry, StepRegistry};
use crate::scheduler::{ScheduleDefinition, Scheduler};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use stepcore::{
    BusConfig, Delivery, DispatchOutcome, Event, EventBus, EventHandler, StepContext,
    StepDefinition, StepError, StepHandler, SubscriptionSpec, TraceContext,
};
use tokio_util::sync::CancellationToken;

/// Outcome of one load or reload.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// Units left out of the registry, each with the reason.
    pub skipped: Vec<RegistryError>,
    /// Step groups whose declared emissions feed each other.
    pub cycles: Vec<Vec<String>>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// One loaded generation: the registry plus the handler bound to each step.
pub struct LoadedSteps {
    registry: StepRegistry,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl LoadedSteps {
    fn empty() -> Self {
        Self {
            registry: StepRegistry::empty(),
            handlers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn handler(&self, step_id: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_id).cloned()
    }

    /// Resolve an inbound request to the API step serving it.
    pub fn route(&self, method: stepcore::HttpMethod, path: &str) -> Option<RouteMatch> {
        let (step, params) = self.registry.route(method, path)?;
        let handler = self.handler(&step.id)?;
        Some(RouteMatch {
            step: Arc::clone(step),
            handler,
            params,
        })
    }
}

pub struct RouteMatch {
    pub step: Arc<StepDefinition>,
    pub handler: Arc<dyn StepHandler>,
    pub params: BTreeMap<String, String>,
}

/// Bus subscriber that runs a step's handler for each delivered event.
struct StepSubscriber {
    step: Arc<StepDefinition>,
    handler: Arc<dyn StepHandler>,
    cancellation: CancellationToken,
}

#[async_trait]
impl EventHandler for StepSubscriber {
    async fn on_event(&self, event: Event, delivery: Delivery) -> Result<(), StepError> {
        let ctx = StepContext {
            step_id: self.step.id.clone(),
            emitter: delivery.emitter(&self.step.id, &self.step.flows),
            trace: delivery.trace,
            config: self.step.config.clone(),
            cancellation: self.cancellation.child_token(),
        };

        let output = self.handler.handle(event, ctx).await?;
        tracing::debug!(step_id = %self.step.id, output = %output, "Step completed");
        Ok(())
    }
}

/// Main runtime: owns the bus, the loaded steps and the scheduler.
///
/// Nothing here is global. Components that need the bus or the registry get
/// them from this value.
pub struct StepRuntime {
    config: RuntimeConfig,
    bus: EventBus,
    handlers: HandlerRegistry,
    source: Arc<dyn StepSource>,
    loaded: RwLock<Arc<LoadedSteps>>,
    /// Held for a whole reload or shutdown, so generations swap one at a time.
    generation_lock: tokio::sync::Mutex<()>,
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
    cancellation: CancellationToken,
    shut_down: AtomicBool,
}

impl StepRuntime {
    /// Runtime discovering steps on the filesystem below `config.roots`.
    pub fn new(config: RuntimeConfig, handlers: HandlerRegistry) -> Self {
        Self::with_source(config, handlers, Arc::new(FsStepSource::new()))
    }

    pub fn with_source(config: RuntimeConfig, handlers: HandlerRegistry, source: Arc<dyn StepSource>) -> Self {
        let bus = EventBus::new(BusConfig {
            tap_capacity: config.event_tap_capacity,
            max_emit_depth: config.max_emit_depth,
        });

        Self {
            config,
            bus,
            handlers,
            source,
            loaded: RwLock::new(Arc::new(LoadedSteps::empty())),
            generation_lock: tokio::sync::Mutex::new(()),
            scheduler: tokio::sync::Mutex::new(None),
            cancellation: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Currently active generation of loaded steps.
    pub fn snapshot(&self) -> Arc<LoadedSteps> {
        let guard = self.loaded.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Initial load. Same as [`reload`](Self::reload).
    pub async fn load(&self) -> Result<LoadReport, RuntimeError> {
        self.reload().await
    }

    /// Discover all steps again and swap them in as one generation.
    ///
    /// Broken units are skipped and reported, never fatal. Dispatch in flight
    /// keeps the generation it started with. A running scheduler is restarted
    /// with the new schedules, then the previous generation's handlers are
    /// retired: this returns once the work they already accepted has finished.
    ///
    /// Concurrent reloads run one after the other.
    pub async fn reload(&self) -> Result<LoadReport, RuntimeError> {
        let _generation = self.generation_lock.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown);
        }

        let (candidates, mut skipped) = StepRegistry::load(self.source.as_ref(), &self.config.roots);

        let mut handlers = HashMap::new();
        let mut accepted = Vec::with_capacity(candidates.len());
        for step in candidates.steps() {
            match self.handlers.create_handler(step) {
                Ok(Some(handler)) => {
                    handlers.insert(step.id.clone(), handler);
                    accepted.push(StepDefinition::clone(step));
                }
                Ok(None) => accepted.push(StepDefinition::clone(step)),
                Err(e) => {
                    tracing::warn!(step_id = %step.id, error = %e, "Skipping step");
                    skipped.push(e);
                }
            }
        }

        let registry = if accepted.len() == candidates.len() {
            candidates
        } else {
            // dropping a step can only remove conflicts, never add them
            StepRegistry::build(accepted).0
        };

        let cycles = emission_cycles(&registry);
        let generation = Arc::new(LoadedSteps { registry, handlers });
        let schedules: Vec<ScheduleDefinition> = generation
            .registry
            .schedules()
            .filter_map(|s| ScheduleDefinition::from_step(s))
            .collect();

        self.bus.replace_registry_subscriptions(self.subscription_specs(&generation));
        let previous = {
            let mut guard = self.loaded.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, Arc::clone(&generation))
        };

        let report = LoadReport {
            loaded: generation.registry.len(),
            skipped,
            cycles,
        };
        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped.len(),
            flows = generation.registry.flows().len(),
            "Steps loaded"
        );

        let restarted = {
            let mut scheduler = self.scheduler.lock().await;
            match scheduler.take() {
                Some(running) => {
                    running.stop().await;
                    let next = Scheduler::new(self.bus.clone(), schedules);
                    let started = next.start();
                    *scheduler = Some(next);
                    started
                }
                None => Ok(()),
            }
        };

        retire_handlers(previous).await;
        restarted?;

        Ok(report)
    }

    fn subscription_specs(&self, generation: &LoadedSteps) -> Vec<SubscriptionSpec> {
        let mut specs = Vec::new();
        for step in generation.registry.steps() {
            let Some(handler) = generation.handler(&step.id) else {
                continue;
            };
            let subscriber: Arc<dyn EventHandler> = Arc::new(StepSubscriber {
                step: Arc::clone(step),
                handler,
                cancellation: self.cancellation.clone(),
            });
            for pattern in step.subscribed_patterns() {
                specs.push(SubscriptionSpec {
                    step_id: step.id.clone(),
                    pattern,
                    handler: Arc::clone(&subscriber),
                });
            }
        }
        specs
    }

    /// Start every loaded schedule. Invalid intervals are reported by schedule id;
    /// the valid schedules run regardless.
    pub async fn start_scheduler(&self) -> Result<(), RuntimeError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown);
        }

        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return Err(crate::scheduler::ScheduleError::AlreadyRunning.into());
        }

        let schedules = self
            .snapshot()
            .registry
            .schedules()
            .filter_map(|s| ScheduleDefinition::from_step(s))
            .collect();
        let next = Scheduler::new(self.bus.clone(), schedules);
        let started = next.start();
        *scheduler = Some(next);
        started.map_err(Into::into)
    }

    /// Stop all schedules. No tick is published after this returns.
    pub async fn stop_scheduler(&self) {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
    }

    /// Publish an event as the start of a new chain.
    pub async fn publish(&self, event: Event) -> Vec<DispatchOutcome> {
        let trace = if event.trace_id.is_empty() {
            TraceContext::new()
        } else {
            TraceContext::with_trace_id(event.trace_id.clone())
        };
        self.bus.publish(event, trace).await
    }

    /// Context for invoking `step` directly, outside of bus delivery.
    pub fn context_for(&self, step: &StepDefinition, trace: TraceContext) -> StepContext {
        StepContext {
            step_id: step.id.clone(),
            emitter: stepcore::Emitter::new(self.bus.clone(), trace.clone(), step.id.clone(), step.flows.clone()),
            trace,
            config: step.config.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Stop the scheduler, drop every registry subscription and shut handlers down.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down step runtime");

        // cancelling first ends any drain a reload is waiting on
        self.cancellation.cancel();
        let _generation = self.generation_lock.lock().await;
        self.stop_scheduler().await;
        self.bus.replace_registry_subscriptions(Vec::new());

        let previous = {
            let mut guard = self.loaded.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, Arc::new(LoadedSteps::empty()))
        };
        shutdown_handlers(&previous).await;
    }
}

async fn shutdown_handlers(generation: &LoadedSteps) {
    for (step_id, handler) in &generation.handlers {
        if let Err(e) = handler.shutdown().await {
            tracing::warn!(step_id = %step_id, error = %e, "Handler shutdown failed");
        }
    }
}

/// Drain a replaced generation, all handlers at once.
async fn retire_handlers(generation: Arc<LoadedSteps>) {
    let retiring = generation.handlers.iter().map(|(step_id, handler)| async move {
        if let Err(e) = handler.retire().await {
            tracing::warn!(step_id = %step_id, error = %e, "Handler retirement failed");
        }
    });
    futures::future::join_all(retiring).await;
}
