//! serpline 核心库
//!
//! 错误分类、配置模型、数据模型、时钟、事件总线，以及外部能力和持久化接口。
//! 任务队列、标注流水线、采集编排和监控服务都只依赖这个 crate 中的类型。

pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::*;
pub use events::{
    AnnotationEvent, ComponentEvent, CycleEvent, EventBus, MonitoringEvent, QueueEvent,
};
