use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serpline_core::errors::ExecutionError;
use serpline_core::models::JobId;

/// 任务队列执行的工作单元
///
/// 队列不关心负载内容，只根据返回的 [`ExecutionError`] 分类决定重试、失败或停机。
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// 执行前的准入等待，例如限流。等待时间不计入任务超时，队列停止时会被中断
    async fn admit(&self, _payload: &Self::Payload, _ctx: &JobContext) {}

    async fn handle(
        &self,
        payload: Self::Payload,
        ctx: JobContext,
    ) -> Result<Self::Output, ExecutionError>;
}

/// 单次执行的上下文
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// 本次执行之前已经失败的次数
    pub attempt: u32,
    pub correlation_id: String,
    cancel_flag: Arc<AtomicBool>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        attempt: u32,
        correlation_id: String,
        cancel_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id,
            attempt,
            correlation_id,
            cancel_flag,
        }
    }

    /// 任务已被取消，结果会被丢弃，处理器可以提前结束
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::Acquire)
    }
}
