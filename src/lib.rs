//! serpline
//!
//! 把任务队列、标注流水线、采集编排和监控服务组装成一个可嵌入的应用。
//! 外部能力（采集器、查询源、标注服务）和持久化仓储由宿主注入。

pub mod app;
pub mod shutdown;

pub use app::{Application, Capabilities, Repositories};
pub use shutdown::ShutdownManager;

pub use serpline_annotation as annotation;
pub use serpline_collector as collector;
pub use serpline_core as core;
pub use serpline_dispatcher as dispatcher;
pub use serpline_infrastructure as infrastructure;
pub use serpline_monitoring as monitoring;
