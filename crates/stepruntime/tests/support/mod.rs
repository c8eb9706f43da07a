#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use stepcore::{Event, StepContext, StepDefinition, StepError, StepHandler};
use stepruntime::{HandlerFactory, HandlerRegistry};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// One handler invocation as seen by [`RecordingHandler`].
#[derive(Debug, Clone)]
pub struct Call {
    pub step_id: String,
    pub event_type: String,
    pub trace_id: String,
    pub origin_step: Option<String>,
    pub data: Value,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub fn calls_for(log: &CallLog, step_id: &str) -> Vec<Call> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|c| c.step_id == step_id)
        .cloned()
        .collect()
}

/// Test handler driven by its step's `config`:
/// `reply` is returned verbatim, `emit` is emitted with the input data,
/// `fail` / `reject` produce an execution / input error.
pub struct RecordingHandler {
    log: CallLog,
}

#[async_trait]
impl StepHandler for RecordingHandler {
    fn kind(&self) -> &str {
        "test.recording"
    }

    async fn handle(&self, event: Event, ctx: StepContext) -> Result<Value, StepError> {
        self.log.lock().unwrap().push(Call {
            step_id: ctx.step_id.clone(),
            event_type: event.event_type.clone(),
            trace_id: ctx.trace_id().to_string(),
            origin_step: ctx.trace.origin_step.clone(),
            data: event.data.clone(),
        });

        if let Some(message) = ctx.config.get("fail").and_then(Value::as_str) {
            return Err(StepError::ExecutionFailed(message.to_string()));
        }
        if let Some(message) = ctx.config.get("reject").and_then(Value::as_str) {
            return Err(StepError::InvalidInput(message.to_string()));
        }
        if let Some(event_type) = ctx.config.get("emit").and_then(Value::as_str) {
            ctx.emitter.emit(event_type, event.data.clone());
        }
        Ok(ctx.config.get("reply").cloned().unwrap_or(event.data))
    }
}

pub struct RecordingFactory {
    log: CallLog,
}

impl HandlerFactory for RecordingFactory {
    fn create(&self, _step: &StepDefinition) -> Result<Arc<dyn StepHandler>, StepError> {
        Ok(Arc::new(RecordingHandler { log: self.log.clone() }))
    }

    fn name(&self) -> &str {
        "record"
    }
}

/// Handler registry with `builtin:record` available, plus the shared call log.
pub fn recording_registry() -> (HandlerRegistry, CallLog) {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(RecordingFactory { log: log.clone() }));
    (handlers, log)
}
