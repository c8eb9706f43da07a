use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub type TraceId = String;

/// Envelope published on the bus.
///
/// `data` is opaque to the core: only the envelope (`type`, trace fields)
/// is ever inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub trace_id: TraceId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            trace_id: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Execution context threaded through one externally triggered chain.
///
/// One HTTP request or one scheduler tick mints a fresh trace id; every
/// downstream emission keeps it while `origin_step` and `depth` follow the
/// hop that produced the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: TraceId,
    #[serde(default)]
    pub flows: BTreeSet<String>,
    #[serde(default)]
    pub origin_step: Option<String>,
    #[serde(default)]
    pub depth: u32,
}

impl TraceContext {
    /// Start a new chain with a freshly generated trace id.
    pub fn new() -> Self {
        Self::with_trace_id(Uuid::new_v4().to_string())
    }

    /// Start a new chain under a trace id supplied by the caller (e.g. an inbound header).
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            flows: BTreeSet::new(),
            origin_step: None,
            depth: 0,
        }
    }

    pub fn with_flows<I, S>(mut self, flows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flows.extend(flows.into_iter().map(Into::into));
        self
    }

    pub fn with_origin(mut self, step_id: impl Into<String>) -> Self {
        self.origin_step = Some(step_id.into());
        self
    }

    /// Context for an event emitted by `step_id` while handling this one.
    pub fn child(&self, step_id: &str, flows: &BTreeSet<String>) -> Self {
        let mut merged = self.flows.clone();
        merged.extend(flows.iter().cloned());
        Self {
            trace_id: self.trace_id.clone(),
            flows: merged,
            origin_step: Some(step_id.to_string()),
            depth: self.depth.saturating_add(1),
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}
