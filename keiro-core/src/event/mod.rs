pub mod event_bus;

pub use event_bus::{Event, EventBus, EventError, EventReceiver, EventResult, EventType};
