//! Infrastructure layer: queue stores, dispatch, execution, workers, config.

pub mod collaborators;
pub mod config;
pub mod fanout;
pub mod handlers;
pub mod jobs;
pub mod workers;

pub use config::{ConfigError, QueueConfig};
pub use fanout::DistributionFanout;
