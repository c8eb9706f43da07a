use crate::runtime::{RouteMatch, StepRuntime};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stepcore::{AuthSpec, Event, HttpMethod, StepError, StepTrigger, TraceContext};
use thiserror::Error;

/// Header carrying the trace id in and out.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Framework-neutral view of an inbound request.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub method: HttpMethod,
    pub path: String,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl TriggerRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, body: &Value) -> Self {
        self.with_body(body.to_string()).with_header("content-type", "application/json")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl TriggerResponse {
    pub fn trace_id(&self) -> Option<&str> {
        self.headers.get(TRACE_HEADER).map(String::as_str)
    }
}

/// Failures of the trigger layer, each mapped to one HTTP status.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    #[error("No step serves {method} {path}")]
    NotFound { method: HttpMethod, path: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    Transform(String),

    #[error("Step '{step_id}' failed: {error}")]
    Handler { step_id: String, error: StepError },

    #[error("Step '{step_id}' did not respond within {millis}ms")]
    Timeout { step_id: String, millis: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TriggerError {
    pub fn status(&self) -> u16 {
        match self {
            TriggerError::NotFound { .. } => 404,
            TriggerError::Unauthorized(_) => 401,
            TriggerError::Transform(_) => 400,
            TriggerError::Handler { error, .. } => match error {
                StepError::Unauthorized(_) => 401,
                e if e.is_client_error() => 400,
                _ => 500,
            },
            TriggerError::Timeout { .. } | TriggerError::Internal(_) => 500,
        }
    }
}

/// Decides whether a request may reach its step.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Err` carries the rejection reason.
    async fn authorize(&self, request: &TriggerRequest) -> Result<(), String>;
}

/// Accepts `Authorization: Bearer <token>` when the token equals the configured one.
pub struct BearerTokenAuthorizer {
    expected: Option<String>,
}

impl BearerTokenAuthorizer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            expected: Some(token.into()),
        }
    }

    /// Token read from environment variable `var`. If it is unset every request is rejected.
    pub fn from_env(var: &str) -> Self {
        let expected = std::env::var(var).ok().filter(|t| !t.is_empty());
        if expected.is_none() {
            tracing::warn!(var, "Bearer token variable is unset; all requests will be rejected");
        }
        Self { expected }
    }
}

#[async_trait]
impl Authorizer for BearerTokenAuthorizer {
    async fn authorize(&self, request: &TriggerRequest) -> Result<(), String> {
        let expected = self.expected.as_deref().ok_or("no token configured")?;
        let presented = request
            .header("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or("missing bearer token")?;
        if presented.trim() == expected {
            Ok(())
        } else {
            Err("invalid bearer token".to_string())
        }
    }
}

/// Turns a request into the payload of the event handed to the step.
pub trait RequestTransform: Send + Sync {
    fn transform(&self, request: &TriggerRequest, params: &BTreeMap<String, String>) -> Result<Value, String>;
}

/// `{ body, query, params, headers }`, with the body parsed as JSON.
/// An empty body becomes `null`; anything else must be valid JSON.
pub struct JsonRequestTransform;

impl RequestTransform for JsonRequestTransform {
    fn transform(&self, request: &TriggerRequest, params: &BTreeMap<String, String>) -> Result<Value, String> {
        let body = if request.body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(&request.body).map_err(|e| format!("body is not valid JSON: {}", e))?
        };

        Ok(json!({
            "body": body,
            "query": request.query,
            "params": params,
            "headers": request.headers,
        }))
    }
}

/// Routes inbound requests to API steps.
///
/// Holds no state of its own beyond per-step transforms; every request reads
/// the runtime's current generation of steps.
pub struct HttpTrigger {
    runtime: Arc<StepRuntime>,
    default_transform: Arc<dyn RequestTransform>,
    transforms: BTreeMap<String, Arc<dyn RequestTransform>>,
}

impl HttpTrigger {
    pub fn new(runtime: Arc<StepRuntime>) -> Self {
        Self {
            runtime,
            default_transform: Arc::new(JsonRequestTransform),
            transforms: BTreeMap::new(),
        }
    }

    /// Use `transform` instead of the JSON transform for one step.
    pub fn with_transform(mut self, step_id: impl Into<String>, transform: Arc<dyn RequestTransform>) -> Self {
        self.transforms.insert(step_id.into(), transform);
        self
    }

    pub fn runtime(&self) -> &Arc<StepRuntime> {
        &self.runtime
    }

    /// Handle one request. Never fails: every error becomes a response.
    pub async fn handle(&self, request: TriggerRequest) -> TriggerResponse {
        let trace = match request.header(TRACE_HEADER).map(str::trim) {
            Some(id) if !id.is_empty() => TraceContext::with_trace_id(id),
            _ => TraceContext::new(),
        };
        let trace_id = trace.trace_id.clone();

        let mut response = match self.dispatch(&request, trace).await {
            Ok(value) => shape_response(value),
            Err(e) => {
                let status = e.status();
                if status >= 500 {
                    tracing::error!(trace_id = %trace_id, route = %request.path, error = %e, "Request failed");
                } else {
                    tracing::info!(trace_id = %trace_id, route = %request.path, status, error = %e, "Request rejected");
                }
                TriggerResponse {
                    status,
                    headers: BTreeMap::new(),
                    body: json!({ "error": e.to_string(), "traceId": trace_id }),
                }
            }
        };

        response.headers.insert(TRACE_HEADER.to_string(), trace_id);
        response
    }

    async fn dispatch(&self, request: &TriggerRequest, trace: TraceContext) -> Result<Value, TriggerError> {
        let route = self
            .runtime
            .snapshot()
            .route(request.method, &request.path)
            .ok_or_else(|| TriggerError::NotFound {
                method: request.method,
                path: request.path.clone(),
            })?;

        let StepTrigger::Api { event_type, auth, .. } = &route.step.trigger else {
            return Err(TriggerError::Internal(format!("step '{}' is not an API step", route.step.id)));
        };

        if let Some(auth) = auth {
            self.authorize(auth, request).await?;
        }

        let transform = self
            .transforms
            .get(&route.step.id)
            .unwrap_or(&self.default_transform);
        let data = transform
            .transform(request, &route.params)
            .map_err(TriggerError::Transform)?;

        let trace = trace.with_flows(route.step.flows.iter().cloned());
        let event = Event::new(event_type.clone(), data)
            .with_trace(trace.trace_id.clone())
            .with_metadata("method", request.method.as_str())
            .with_metadata("path", request.path.clone());

        tracing::debug!(
            trace_id = %trace.trace_id,
            step_id = %route.step.id,
            event_type = %event.event_type,
            route = %request.path,
            "Dispatching request"
        );
        // the route's own step answers the request; other matching subscribers
        // get the event through the bus. API steps hold no subscriptions.
        tokio::spawn(self.runtime.bus().publish(event.clone(), trace.clone()));
        self.invoke(route, event, trace).await
    }

    async fn authorize(&self, auth: &AuthSpec, request: &TriggerRequest) -> Result<(), TriggerError> {
        let authorizer: Arc<dyn Authorizer> = match auth {
            AuthSpec::BearerTokenEnv(var) => Arc::new(BearerTokenAuthorizer::from_env(var)),
            AuthSpec::Authorizer(name) => self
                .runtime
                .handlers()
                .authorizer(name)
                .ok_or_else(|| TriggerError::Internal(format!("no authorizer named '{}'", name)))?,
        };
        authorizer.authorize(request).await.map_err(TriggerError::Unauthorized)
    }

    /// Run the handler on its own task.
    ///
    /// On timeout, or when the caller drops this future, the handler's
    /// cancellation token fires: bridged workers are killed. Events it already
    /// emitted stay published.
    async fn invoke(&self, route: RouteMatch, event: Event, trace: TraceContext) -> Result<Value, TriggerError> {
        let step_id = route.step.id.clone();
        let ctx = self.runtime.context_for(&route.step, trace);
        let _cancel_on_drop = ctx.cancellation.clone().drop_guard();
        let handler = route.handler;

        let task = tokio::spawn(async move { handler.handle(event, ctx).await });

        let joined = match self.runtime.config().request_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(TriggerError::Timeout {
                        step_id,
                        millis: millis(limit),
                    })
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TriggerError::Handler { step_id, error }),
            Err(e) => Err(TriggerError::Handler {
                step_id,
                error: StepError::Panicked(e.to_string()),
            }),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// `{ "status": 201, "body": .., "headers": {..} }` sets the response explicitly;
/// any other value is a 200 body.
pub fn shape_response(value: Value) -> TriggerResponse {
    if let Value::Object(mut object) = value {
        let status = object
            .get("status")
            .and_then(Value::as_u64)
            .filter(|s| (100..=599).contains(s));
        if let (Some(status), true) = (status, object.contains_key("body")) {
            let headers = match object.remove("headers") {
                Some(Value::Object(headers)) => headers
                    .into_iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.to_ascii_lowercase(), v.to_string())))
                    .collect(),
                _ => BTreeMap::new(),
            };
            return TriggerResponse {
                status: status as u16,
                headers,
                body: object.remove("body").unwrap_or(Value::Null),
            };
        }
        return ok(Value::Object(object));
    }
    ok(value)
}

fn ok(body: Value) -> TriggerResponse {
    TriggerResponse {
        status: 200,
        headers: BTreeMap::new(),
        body,
    }
}
