use crate::events::{Emitter, Event, TraceContext};
use crate::StepError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

pub type StepId = String;

/// Core trait every step implementation provides, in-process or bridged.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Short identifier of the implementation (e.g. "builtin.log", "process.python").
    fn kind(&self) -> &str;

    /// Handle one event. The returned value is the step's output; API steps
    /// turn it into the HTTP response body.
    async fn handle(&self, event: Event, ctx: StepContext) -> Result<serde_json::Value, StepError>;

    /// Optional: release resources (worker processes, connections).
    async fn shutdown(&self) -> Result<(), StepError> {
        Ok(())
    }

    /// Called when a reload replaces this handler. Invocations already in
    /// flight run to completion before resources are released.
    async fn retire(&self) -> Result<(), StepError> {
        self.shutdown().await
    }
}

/// Execution context passed to each handler invocation.
#[derive(Clone)]
pub struct StepContext {
    pub step_id: StepId,

    /// Context of the chain this invocation belongs to.
    pub trace: TraceContext,

    /// Publishes follow-up events under the inherited trace.
    pub emitter: Emitter,

    /// Opaque `config` block of the step manifest.
    pub config: serde_json::Value,

    pub cancellation: CancellationToken,
}

impl StepContext {
    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&serde_json::Value, StepError> {
        self.config
            .get(name)
            .ok_or_else(|| StepError::Configuration(format!("Missing config: {}", name)))
    }

    pub fn config_u64_or(&self, name: &str, default: u64) -> u64 {
        self.config.get(name).and_then(|v| v.as_u64()).unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported HTTP method '{}'", other)),
        }
    }
}

/// How an API step authorizes inbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthSpec {
    /// `Authorization: Bearer <token>` compared to the value of an environment variable.
    BearerTokenEnv(String),
    /// An authorizer registered by name with the handler registry.
    Authorizer(String),
}

/// What causes a step to run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepTrigger {
    Event {
        subscribes: Vec<String>,
    },
    Api {
        method: HttpMethod,
        path: String,
        event_type: String,
        auth: Option<AuthSpec>,
    },
    Schedule {
        interval: String,
        event_type: String,
    },
}

impl StepTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            StepTrigger::Event { .. } => "event",
            StepTrigger::Api { .. } => "api",
            StepTrigger::Schedule { .. } => "schedule",
        }
    }
}

/// Where the handler of a step lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum HandlerRef {
    /// In-process handler registered by name.
    Builtin(String),
    /// Source file executed by an out-of-process worker.
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    InProcess,
    OutOfProcess,
}

/// Immutable description of one discovered step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: StepId,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Manifest the definition was parsed from.
    pub source: PathBuf,
    pub trigger: StepTrigger,
    /// Declared output types. Advisory only.
    pub emits: BTreeSet<String>,
    pub flows: BTreeSet<String>,
    pub handler: Option<HandlerRef>,
    pub execution: ExecutionKind,
    pub language_runtime: Option<String>,
    pub config: serde_json::Value,
}

impl StepDefinition {
    /// Patterns this step is subscribed to on the bus.
    ///
    /// Scheduled steps with a handler listen to their own tick type.
    pub fn subscribed_patterns(&self) -> Vec<String> {
        match &self.trigger {
            StepTrigger::Event { subscribes } => subscribes.clone(),
            StepTrigger::Schedule { event_type, .. } if self.handler.is_some() => {
                vec![event_type.clone()]
            }
            _ => Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Named grouping of steps. Labels traces, carries no behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub name: String,
    pub steps: Vec<StepId>,
}
