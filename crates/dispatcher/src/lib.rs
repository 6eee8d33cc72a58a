//! 任务队列
//!
//! 通用的有界并发执行器：严格优先级调度、指数退避重试、单次执行超时和协作式取消。
//! 标注流水线在它之上实现去重和批处理，采集编排器复用其中的 [`RetryPolicy`]。

pub mod handler;
pub mod retry_policy;
mod state;
pub mod task_queue;

pub use handler::{JobContext, JobHandler};
pub use retry_policy::RetryPolicy;
pub use state::QueueStats;
pub use task_queue::{SubmitOptions, TaskQueue};
