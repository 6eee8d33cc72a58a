//! serpline 基础设施
//!
//! 结构化日志初始化、指标记录、任务审计，以及核心仓储接口的内存实现。

pub mod audit;
pub mod logging;
pub mod memory_repository;
pub mod metrics_recorder;

pub use audit::JobAuditRecorder;
pub use logging::init_structured_logging;
pub use memory_repository::{
    InMemoryAlertRepository, InMemoryCacheEntryRepository, InMemoryCycleExecutionRepository,
    InMemoryHealthCheckRepository, InMemoryJobRepository,
};
pub use metrics_recorder::{spawn_event_recorder, MetricsCollector};
