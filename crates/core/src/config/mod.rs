//! 配置模型
//!
//! `AppConfig` 按组件划分为五个部分，每个部分都有默认值和独立的 `validate()`。
//! 组件在构造时接收自己那一部分配置，不读取全局状态。
//!
//! ```rust,no_run
//! use serpline_core::config::AppConfig;
//!
//! let config = AppConfig::load(Some("config/serpline.toml")).expect("配置加载失败");
//! assert!(config.queue.concurrency > 0);
//! ```

pub mod models;

pub use models::{
    AlertThresholds, AnnotationConfig, AppConfig, CollectionConfig, CommandProviderConfig,
    LoggingConfig, MonitoringConfig, QueueConfig,
};
