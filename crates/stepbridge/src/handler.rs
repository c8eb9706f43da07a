use crate::protocol::Invocation;
use crate::session::{BridgeConfig, BridgeSession};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use stepcore::{Event, StepContext, StepDefinition, StepError, StepHandler};
use stepruntime::{HandlerFactory, HandlerMetadata, PROCESS_FACTORY};

/// Runs a step whose handler is a source file, through its own bridge session.
pub struct ProcessHandler {
    session: BridgeSession,
    kind: String,
}

impl ProcessHandler {
    pub fn new(step: &StepDefinition, config: Arc<BridgeConfig>) -> Result<Self, StepError> {
        let session = BridgeSession::new(step, config)?;
        let kind = format!("process.{}", session.runtime());
        Ok(Self { session, kind })
    }

    pub fn session(&self) -> &BridgeSession {
        &self.session
    }
}

#[async_trait]
impl StepHandler for ProcessHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn handle(&self, event: Event, ctx: StepContext) -> Result<Value, StepError> {
        let invocation = Invocation {
            step_id: ctx.step_id.clone(),
            trace_id: ctx.trace_id().to_string(),
            flows: ctx.trace.flows.clone(),
            event_type: event.event_type,
            data: event.data,
        };

        let outcome = self
            .session
            .invoke(invocation, &ctx.emitter, &ctx.cancellation)
            .await?;
        tracing::debug!(
            step_id = %ctx.step_id,
            trace_id = %ctx.trace_id(),
            emitted = outcome.emitted.len(),
            "Worker completed"
        );
        Ok(outcome.result)
    }

    async fn shutdown(&self) -> Result<(), StepError> {
        self.session.shutdown().await;
        Ok(())
    }

    async fn retire(&self) -> Result<(), StepError> {
        self.session.retire().await;
        Ok(())
    }
}

/// Creates a [`ProcessHandler`] for every out-of-process step.
pub struct ProcessBridgeFactory {
    config: Arc<BridgeConfig>,
}

impl ProcessBridgeFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl HandlerFactory for ProcessBridgeFactory {
    fn create(&self, step: &StepDefinition) -> Result<Arc<dyn StepHandler>, StepError> {
        Ok(Arc::new(ProcessHandler::new(step, self.config.clone())?))
    }

    fn name(&self) -> &str {
        PROCESS_FACTORY
    }

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            description: format!(
                "Runs handler files in worker processes ({})",
                self.config.runners.runtimes().join(", ")
            ),
            category: "process".to_string(),
        }
    }
}
