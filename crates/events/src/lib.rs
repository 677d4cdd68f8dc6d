//! Queue events and the pub/sub plumbing that carries them.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{Event, QueueEvent};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
