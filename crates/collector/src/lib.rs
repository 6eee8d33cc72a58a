//! 采集周期编排
//!
//! 管理采集周期定义，按轮换策略选出查询，把每个 查询×引擎 组合交给
//! [`serpline_core::traits::Collector`] 采集，并以事件形式发布进度。

pub mod orchestrator;
pub mod rotation;

pub use orchestrator::CollectionOrchestrator;
pub use rotation::QueryRotation;
