//! Pipeline lifecycle events: durable log plus live fan-out.

pub mod event_bus;
pub mod pipeline_event;

pub use event_bus::{EventBus, EventSubscription, MAX_HISTORY};
pub use pipeline_event::{EventData, EventType, NewEvent, PipelineEvent};
