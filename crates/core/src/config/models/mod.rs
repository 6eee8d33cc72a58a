pub mod annotation;
pub mod app_config;
pub mod collection;
pub mod logging;
pub mod monitoring;
pub mod queue;

pub use annotation::{AnnotationConfig, CommandProviderConfig};
pub use app_config::AppConfig;
pub use collection::CollectionConfig;
pub use logging::LoggingConfig;
pub use monitoring::{AlertThresholds, MonitoringConfig};
pub use queue::QueueConfig;
