//! Core abstractions for the step orchestration runtime
//!
//! Event envelopes, trace contexts, topic matching, the in-memory event bus
//! and the handler trait every step implementation provides. No I/O lives
//! here beyond spawning handler tasks.

mod error;
pub mod events;
mod step;

pub use error::{BusError, StepError};
pub use events::*;
pub use step::{
    AuthSpec, ExecutionKind, Flow, HandlerRef, HttpMethod, StepContext, StepDefinition,
    StepHandler, StepId, StepTrigger,
};

/// Result type for step operations
pub type Result<T> = std::result::Result<T, StepError>;
