pub mod config;
pub mod errors;

pub use config::{
    AppConfig, CoordinationConfig, DatabaseConfig, NotificationConfig, ObservabilityConfig,
    SchedulerConfig,
};
pub use errors::{RudderError, RudderResult};
