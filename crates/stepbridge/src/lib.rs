//! Step handlers
//!
//! The cross-process bridge that runs handler files in worker processes,
//! plus the built-in in-process handlers.

mod delay;
mod handler;
mod log;
pub mod protocol;
mod relay;
mod runners;
mod session;

pub use delay::DelayHandler;
pub use handler::{ProcessBridgeFactory, ProcessHandler};
pub use log::LogHandler;
pub use protocol::{Invocation, ProtocolError, WireMessage};
pub use relay::RelayHandler;
pub use runners::{RunnerCommand, RunnerTable};
pub use session::{BridgeConfig, BridgeError, BridgeOutcome, BridgeSession};
use stepruntime::HandlerRegistry;

use std::sync::Arc;

/// Register the bridge and every built-in handler with a registry
pub fn register_all(registry: &mut HandlerRegistry, bridge: BridgeConfig) {
    registry.register(Arc::new(ProcessBridgeFactory::new(bridge)));
    registry.register(Arc::new(log::LogHandlerFactory));
    registry.register(Arc::new(delay::DelayHandlerFactory));
    registry.register(Arc::new(relay::RelayHandlerFactory));
}
