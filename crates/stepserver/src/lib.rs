//! HTTP surface of the step runtime
//!
//! Every request that no fixed route claims is handed to the [`HttpTrigger`],
//! which maps it to an API step by method and path.

use actix_web::http::StatusCode;
use actix_web::{get, web, HttpRequest, HttpResponse, Responder};
use std::collections::BTreeMap;
use std::sync::Arc;
use stepcore::{HttpMethod, StepDefinition, StepTrigger};
use stepruntime::{HttpTrigger, TriggerRequest, TriggerResponse};

/// Application state shared across handlers
pub struct AppState {
    pub trigger: Arc<HttpTrigger>,
}

impl AppState {
    pub fn new(trigger: HttpTrigger) -> Self {
        Self {
            trigger: Arc::new(trigger),
        }
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "stepserver",
        "steps": data.trigger.runtime().snapshot().registry().len(),
    }))
}

/// Registered steps, routes, schedules and flows
#[get("/__steps")]
async fn list_steps(data: web::Data<AppState>) -> impl Responder {
    let runtime = data.trigger.runtime();
    let snapshot = runtime.snapshot();
    let registry = snapshot.registry();

    let steps: Vec<&StepDefinition> = registry.steps().iter().map(|s| s.as_ref()).collect();
    let routes: Vec<_> = registry
        .routes()
        .iter()
        .map(|(route, step_id)| serde_json::json!({ "route": route.to_string(), "step": step_id }))
        .collect();
    let schedules: Vec<_> = registry
        .schedules()
        .filter_map(|s| match &s.trigger {
            StepTrigger::Schedule { interval, event_type } => Some(serde_json::json!({
                "step": s.id,
                "interval": interval,
                "eventType": event_type,
            })),
            _ => None,
        })
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "steps": steps,
        "routes": routes,
        "schedules": schedules,
        "flows": registry.flows(),
        "handlerTypes": runtime.handlers().list_handler_types(),
    }))
}

/// Hand any other request to the step serving its method and path
async fn dispatch(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    let method = match req.method().as_str().parse::<HttpMethod>() {
        Ok(method) => method,
        Err(e) => {
            return HttpResponse::MethodNotAllowed().json(serde_json::json!({ "error": e }));
        }
    };

    let response = data.trigger.handle(trigger_request(method, &req, body)).await;
    into_http_response(response)
}

fn trigger_request(method: HttpMethod, req: &HttpRequest, body: web::Bytes) -> TriggerRequest {
    let mut request = TriggerRequest::new(method, req.path()).with_body(body.to_vec());

    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }

    request.query = web::Query::<BTreeMap<String, String>>::from_query(req.query_string())
        .map(|q| q.into_inner())
        .unwrap_or_else(|e| {
            tracing::debug!(route = %req.path(), "Ignoring unparseable query string: {}", e);
            BTreeMap::new()
        });

    request
}

fn into_http_response(response: TriggerResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &response.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    builder.json(response.body)
}

/// Mount the introspection routes and the step dispatcher
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_steps)
        .default_service(web::to(dispatch));
}
