use crate::events::{Event, EventBus, TraceContext};
use std::collections::BTreeSet;

/// Handle a step uses to publish follow-up events.
///
/// Emitted events inherit the trace id of the event being handled; the
/// emitting step becomes their origin.
#[derive(Clone)]
pub struct Emitter {
    bus: EventBus,
    trace: TraceContext,
    step_id: String,
    flows: BTreeSet<String>,
}

impl Emitter {
    pub fn new(
        bus: EventBus,
        trace: TraceContext,
        step_id: impl Into<String>,
        flows: BTreeSet<String>,
    ) -> Self {
        Self {
            bus,
            trace,
            step_id: step_id.into(),
            flows,
        }
    }

    /// Publish `data` under `event_type`. Fire-and-forget.
    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) {
        self.send(self.envelope(event_type, data));
    }

    /// Publish a prepared envelope. Returns `false` if the depth guard dropped it.
    pub fn send(&self, event: Event) -> bool {
        self.bus.emit_from(&self.trace, &self.step_id, &self.flows, event)
    }

    /// Build the envelope `emit` would publish, without publishing it.
    pub fn envelope(&self, event_type: impl Into<String>, data: serde_json::Value) -> Event {
        Event::new(event_type, data).with_trace(self.trace.trace_id.clone())
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("step_id", &self.step_id)
            .field("trace_id", &self.trace.trace_id)
            .finish()
    }
}
