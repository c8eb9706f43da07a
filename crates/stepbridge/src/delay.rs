use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use stepcore::{Event, StepContext, StepDefinition, StepError, StepHandler};
use stepruntime::{HandlerFactory, HandlerMetadata};
use tokio::time::{sleep, Duration};

/// Waits `config.delayMs` (default one second), then returns the payload
pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    fn kind(&self) -> &str {
        "builtin.delay"
    }

    async fn handle(&self, event: Event, ctx: StepContext) -> Result<Value, StepError> {
        let delay_ms = ctx.config_u64_or("delayMs", 1000);

        tracing::debug!(step_id = %ctx.step_id, trace_id = %ctx.trace_id(), delay_ms, "Delaying");

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => Ok(event.data),
            _ = ctx.cancellation.cancelled() => Err(StepError::Cancelled),
        }
    }
}

pub struct DelayHandlerFactory;

impl HandlerFactory for DelayHandlerFactory {
    fn create(&self, step: &StepDefinition) -> Result<Arc<dyn StepHandler>, StepError> {
        match step.config.get("delayMs") {
            None => {}
            Some(v) if v.is_u64() => {}
            Some(other) => {
                return Err(StepError::Configuration(format!(
                    "delayMs must be a non-negative integer, got {}",
                    other
                )))
            }
        }
        Ok(Arc::new(DelayHandler))
    }

    fn name(&self) -> &str {
        "delay"
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: "Delay for the configured milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
