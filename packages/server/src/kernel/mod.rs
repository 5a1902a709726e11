//! Kernel module - server infrastructure and dependencies.

pub mod breaker;
pub mod deps;
pub mod health;
pub mod jobs;
pub mod pipeline_client;
pub mod scheduled_tasks;
pub mod test_dependencies;
pub mod traits;

pub use breaker::{BreakerError, BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use deps::ServerDeps;
pub use health::{HealthMonitor, HealthStatus, SystemHealth};
pub use pipeline_client::{HttpCrawler, HttpTrainer};
pub use scheduled_tasks::start_scheduler;
pub use test_dependencies::TestDependencies;
pub use traits::*;
