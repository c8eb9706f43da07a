mod bus;
mod emitter;
mod event;
mod pattern;

pub use bus::{
    handler_fn, BusConfig, BusRecord, Delivery, DispatchOutcome, EventBus, EventHandler,
    Subscription, SubscriptionId, SubscriptionOrigin, SubscriptionSpec,
};
pub use emitter::Emitter;
pub use event::{Event, TraceContext, TraceId};
pub use pattern::{topic_matches, TopicPattern};
