use crate::events::{Emitter, Event, TopicPattern, TraceContext};
use crate::{BusError, StepError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::broadcast;

pub type SubscriptionId = u64;

/// Anything that can receive events from the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: Event, delivery: Delivery) -> Result<(), StepError>;
}

/// What a handler gets alongside the event: the chain's context and a way back onto the bus.
#[derive(Clone)]
pub struct Delivery {
    pub trace: TraceContext,
    pub bus: EventBus,
}

impl Delivery {
    /// Emitter that publishes follow-up events on behalf of `step_id`.
    pub fn emitter(&self, step_id: &str, flows: &BTreeSet<String>) -> Emitter {
        Emitter::new(self.bus.clone(), self.trace.clone(), step_id, flows.clone())
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    async fn on_event(&self, event: Event, delivery: Delivery) -> Result<(), StepError> {
        (self.0)(event, delivery).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionOrigin {
    /// Owned by the loaded step registry; replaced wholesale on reload.
    Registry,
    /// Added through [`EventBus::subscribe`]; survives reloads.
    Manual,
}

#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: TopicPattern,
    pub step_id: String,
    pub origin: SubscriptionOrigin,
    handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("step_id", &self.step_id)
            .field("origin", &self.origin)
            .finish()
    }
}

/// A registry-owned subscription waiting to be installed.
pub struct SubscriptionSpec {
    pub step_id: String,
    pub pattern: String,
    pub handler: Arc<dyn EventHandler>,
}

/// Result of delivering one event to one subscriber.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub subscription: SubscriptionId,
    pub step_id: String,
    pub result: Result<(), StepError>,
}

impl DispatchOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Observer records broadcast for every bus action.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum BusRecord {
    Published {
        event: Event,
        subscribers: usize,
        timestamp: DateTime<Utc>,
    },
    Delivered {
        trace_id: String,
        event_type: String,
        step_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        trace_id: String,
        event_type: String,
        step_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Dropped {
        trace_id: String,
        event_type: String,
        step_id: Option<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Buffer of the observer tap; slow observers lag instead of blocking publishers.
    pub tap_capacity: usize,
    /// Maximum hop count of an emitted event within one chain. `0` disables the guard.
    pub max_emit_depth: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tap_capacity: 1000,
            max_emit_depth: 32,
        }
    }
}

struct BusInner {
    subscriptions: RwLock<Arc<Vec<Subscription>>>,
    next_id: AtomicU64,
    tap: broadcast::Sender<BusRecord>,
    config: BusConfig,
}

/// In-memory publish/subscribe bus with wildcard topic matching.
///
/// Cloning is cheap and yields a handle to the same bus. The subscriber list
/// is copy-on-write: every publish works on one immutable snapshot, so a
/// concurrent swap is observed either fully or not at all.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (tap, _) = broadcast::channel(config.tap_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(1),
                tap,
                config,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register a manual subscription.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.subscribe_as("manual", pattern, handler)
    }

    /// Register a manual subscription labelled with a step id for logs and outcomes.
    pub fn subscribe_as(
        &self,
        step_id: &str,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let subscription = Subscription {
            id: self.next_id(),
            pattern: TopicPattern::parse(pattern),
            step_id: step_id.to_string(),
            origin: SubscriptionOrigin::Manual,
            handler,
        };
        if subscription.pattern.is_inert() {
            tracing::warn!(step_id, pattern, "Subscription pattern can never match");
        }
        let id = subscription.id;
        self.update(|current| {
            let mut next = current.to_vec();
            next.push(subscription);
            next
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let mut found = false;
        self.update(|current| {
            let next: Vec<Subscription> = current.iter().filter(|s| s.id != id).cloned().collect();
            found = next.len() != current.len();
            next
        });
        if found {
            Ok(())
        } else {
            Err(BusError::UnknownSubscription(id))
        }
    }

    /// Replace every registry-owned subscription in a single swap.
    ///
    /// Manual subscriptions are carried over untouched. Returns the ids
    /// assigned to the new subscriptions, in input order.
    pub fn replace_registry_subscriptions(&self, specs: Vec<SubscriptionSpec>) -> Vec<SubscriptionId> {
        let fresh: Vec<Subscription> = specs
            .into_iter()
            .map(|spec| Subscription {
                id: self.next_id(),
                pattern: TopicPattern::parse(&spec.pattern),
                step_id: spec.step_id,
                origin: SubscriptionOrigin::Registry,
                handler: spec.handler,
            })
            .collect();
        let ids = fresh.iter().map(|s| s.id).collect();

        self.update(move |current| {
            let mut next: Vec<Subscription> = fresh;
            next.extend(
                current
                    .iter()
                    .filter(|s| s.origin == SubscriptionOrigin::Manual)
                    .cloned(),
            );
            next
        });
        ids
    }

    /// Current subscriber list snapshot.
    pub fn subscriptions(&self) -> Arc<Vec<Subscription>> {
        let guard = self
            .inner
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Observe bus activity.
    pub fn tap(&self) -> broadcast::Receiver<BusRecord> {
        self.inner.tap.subscribe()
    }

    /// Deliver `event` to every matching subscriber concurrently.
    ///
    /// The subscriber snapshot is taken when this is called, not when the
    /// returned future is first polled. The future resolves once every
    /// matching handler has completed or failed; failures are isolated per
    /// subscriber and reported in the outcome list, never raised. Handlers
    /// run on their own tasks, so dropping the future does not cancel them.
    pub fn publish(&self, mut event: Event, trace: TraceContext) -> BoxFuture<'static, Vec<DispatchOutcome>> {
        event.trace_id = trace.trace_id.clone();

        let matching: Vec<Subscription> = self
            .subscriptions()
            .iter()
            .filter(|s| s.pattern.matches(&event.event_type))
            .cloned()
            .collect();

        tracing::debug!(
            trace_id = %event.trace_id,
            event_type = %event.event_type,
            subscribers = matching.len(),
            "Publishing event"
        );
        self.record(BusRecord::Published {
            event: event.clone(),
            subscribers: matching.len(),
            timestamp: Utc::now(),
        });

        if matching.is_empty() {
            return future::ready(Vec::new()).boxed();
        }

        let bus = self.clone();
        async move { bus.fan_out(event, trace, matching).await }.boxed()
    }

    /// Publish a follow-up event emitted by `step_id` while handling `parent`.
    ///
    /// The nested round runs detached; the caller does not wait for it.
    /// Returns `false` when the depth guard dropped the event.
    pub fn emit_from(&self, parent: &TraceContext, step_id: &str, flows: &BTreeSet<String>, event: Event) -> bool {
        let trace = parent.child(step_id, flows);
        let max_depth = self.inner.config.max_emit_depth;

        if max_depth > 0 && trace.depth > max_depth {
            tracing::warn!(
                trace_id = %trace.trace_id,
                step_id,
                event_type = %event.event_type,
                depth = trace.depth,
                "Emit depth limit reached, dropping event"
            );
            self.record(BusRecord::Dropped {
                trace_id: trace.trace_id.clone(),
                event_type: event.event_type.clone(),
                step_id: Some(step_id.to_string()),
                reason: format!("emit depth {} exceeds limit {}", trace.depth, max_depth),
                timestamp: Utc::now(),
            });
            return false;
        }

        let round = self.publish(event, trace);
        tokio::spawn(round);
        true
    }

    async fn fan_out(
        &self,
        event: Event,
        trace: TraceContext,
        matching: Vec<Subscription>,
    ) -> Vec<DispatchOutcome> {
        let mut running = FuturesUnordered::new();

        for subscription in matching {
            let delivery = Delivery {
                trace: trace.clone(),
                bus: self.clone(),
            };
            let handler = Arc::clone(&subscription.handler);
            let event = event.clone();
            let task = tokio::spawn(async move {
                let start = Instant::now();
                let result = handler.on_event(event, delivery).await;
                (result, start.elapsed().as_millis() as u64)
            });
            running.push(async move { (subscription.id, subscription.step_id, task.await) });
        }

        let mut outcomes = Vec::with_capacity(running.len());
        while let Some((id, step_id, joined)) = running.next().await {
            let result = match joined {
                Ok((Ok(()), duration_ms)) => {
                    self.record(BusRecord::Delivered {
                        trace_id: event.trace_id.clone(),
                        event_type: event.event_type.clone(),
                        step_id: step_id.clone(),
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                    Ok(())
                }
                Ok((Err(e), _)) => Err(e),
                Err(join_error) => Err(StepError::Panicked(join_error.to_string())),
            };

            if let Err(e) = &result {
                tracing::error!(
                    trace_id = %event.trace_id,
                    step_id = %step_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Subscriber failed"
                );
                self.record(BusRecord::Failed {
                    trace_id: event.trace_id.clone(),
                    event_type: event.event_type.clone(),
                    step_id: step_id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }

            outcomes.push(DispatchOutcome {
                subscription: id,
                step_id,
                result,
            });
        }

        outcomes
    }

    fn next_id(&self) -> SubscriptionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&[Subscription]) -> Vec<Subscription>,
    {
        let mut guard = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = f(guard.as_slice());
        *guard = Arc::new(next);
    }

    fn record(&self, record: BusRecord) {
        let _ = self.inner.tap.send(record);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions().len())
            .field("observers", &self.inner.tap.receiver_count())
            .finish()
    }
}
