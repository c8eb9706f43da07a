use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use stepcore::{Event, StepContext, StepDefinition, StepError, StepHandler};
use stepruntime::{HandlerFactory, HandlerMetadata};

/// Re-emits the payload under another event type
pub struct RelayHandler {
    to: String,
}

#[async_trait]
impl StepHandler for RelayHandler {
    fn kind(&self) -> &str {
        "builtin.relay"
    }

    async fn handle(&self, event: Event, ctx: StepContext) -> Result<Value, StepError> {
        if !ctx.emitter.send(ctx.emitter.envelope(self.to.clone(), event.data)) {
            tracing::warn!(step_id = %ctx.step_id, trace_id = %ctx.trace_id(), to = %self.to, "Relay dropped");
        }
        Ok(Value::Null)
    }
}

pub struct RelayHandlerFactory;

impl HandlerFactory for RelayHandlerFactory {
    fn create(&self, step: &StepDefinition) -> Result<Arc<dyn StepHandler>, StepError> {
        let to = step
            .config
            .get("to")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| StepError::Configuration("relay needs a `to` event type".to_string()))?;

        Ok(Arc::new(RelayHandler { to: to.to_string() }))
    }

    fn name(&self) -> &str {
        "relay"
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Re-emit input under another event type".to_string(),
            category: "transform".to_string(),
        }
    }
}
