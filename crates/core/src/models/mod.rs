//! # 数据模型
//!
//! 采集、标注和监控三条链路共用的核心数据结构。
//!
//! ## 核心模型
//!
//! ### Job - 队列任务
//! 任务队列中的一个可重试工作单元，负载类型由使用方决定。
//! 状态流转：
//! ```text
//! Pending ⇄ Running → Succeeded
//!                   → Failed
//!                   → Cancelled
//! ```
//!
//! ### CacheEntry - 标注缓存
//! 以内容指纹为键的标注结果，写入后不可变，按 TTL 和 LRU 淘汰。
//!
//! ### CycleConfig / CycleExecution - 采集周期
//! 周期定义和它的一次运行，运行进度以 查询×引擎 组合计数。
//!
//! ### Alert / HealthCheckResult - 告警与健康检查
//! 由监控服务根据指标快照和组件上报生成。
//!
//! 所有时间字段使用 `DateTime<Utc>`，所有模型都实现了 serde 序列化。

pub mod alert;
pub mod annotation;
pub mod cycle;
pub mod health;
pub mod job;
pub mod metrics;

pub use alert::*;
pub use annotation::*;
pub use cycle::*;
pub use health::*;
pub use job::*;
pub use metrics::*;
