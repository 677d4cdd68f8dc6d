//! Background drivers: interval loops for the scheduler and maintenance,
//! and a subscription thread for event-driven fan-out.

pub mod event_worker;
pub mod periodic;

pub use event_worker::{EventWorker, WorkerHandle};
pub use periodic::{PeriodicHandle, PeriodicTask};
