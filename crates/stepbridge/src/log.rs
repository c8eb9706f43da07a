use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use stepcore::{Event, StepContext, StepDefinition, StepError, StepHandler};
use stepruntime::{HandlerFactory, HandlerMetadata};

/// Logs every event it receives and returns the payload unchanged
pub struct LogHandler;

#[async_trait]
impl StepHandler for LogHandler {
    fn kind(&self) -> &str {
        "builtin.log"
    }

    async fn handle(&self, event: Event, ctx: StepContext) -> Result<Value, StepError> {
        tracing::info!(
            step_id = %ctx.step_id,
            trace_id = %ctx.trace_id(),
            event_type = %event.event_type,
            data = %event.data,
            "Event received"
        );

        Ok(event.data)
    }
}

pub struct LogHandlerFactory;

impl HandlerFactory for LogHandlerFactory {
    fn create(&self, _step: &StepDefinition) -> Result<Arc<dyn StepHandler>, StepError> {
        Ok(Arc::new(LogHandler))
    }

    fn name(&self) -> &str {
        "log"
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Logs received events".to_string(),
            category: "debug".to_string(),
        }
    }
}
