//! Step orchestration runtime
//!
//! Discovers step manifests, builds the step/flow registry, wires every step
//! onto the event bus and drives the two external triggers: HTTP requests
//! and fixed-interval schedules.

mod config;
mod error;
mod graph;
pub mod http_trigger;
mod loader;
mod manifest;
mod registry;
mod runtime;
pub mod scheduler;

pub use config::RuntimeConfig;
pub use error::{RegistryError, RuntimeError};
pub use graph::{emission_cycles, emission_graph};
pub use http_trigger::{
    Authorizer, BearerTokenAuthorizer, HttpTrigger, JsonRequestTransform, RequestTransform,
    TriggerError, TriggerRequest, TriggerResponse, TRACE_HEADER,
};
pub use loader::{step_id_for, FsStepSource, RawStepDescriptor, StaticStepSource, StepSource, MANIFEST_SUFFIX};
pub use manifest::{default_api_event_type, infer_runtime, parse_descriptor, BUILTIN_PREFIX};
pub use registry::{
    match_path, normalize_route, HandlerFactory, HandlerMetadata, HandlerRegistry, RouteKey,
    StepRegistry, PROCESS_FACTORY,
};
pub use runtime::{LoadReport, LoadedSteps, RouteMatch, StepRuntime};
pub use scheduler::{parse_interval, IntervalSpec, ScheduleDefinition, ScheduleError, Scheduler, MAX_INTERVAL};
