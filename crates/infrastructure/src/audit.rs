use std::sync::Arc;

use serpline_core::events::{ComponentEvent, QueueEvent};
use serpline_core::traits::JobRepository;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 把任务队列事件中的任务快照写入任务仓储
pub struct JobAuditRecorder {
    repository: Arc<dyn JobRepository>,
}

impl JobAuditRecorder {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self { repository }
    }

    /// 写入失败只记录日志，不影响队列
    pub async fn record<O>(&self, event: &QueueEvent<O>) {
        let Some(job) = event.job() else {
            return;
        };
        if let Err(e) = self.repository.upsert(job).await {
            warn!(
                job_id = %job.id,
                event = event.event_type(),
                "保存任务记录失败: {e}"
            );
        }
    }

    pub fn spawn<O: Send + Sync + 'static>(
        self,
        mut events: mpsc::UnboundedReceiver<QueueEvent<O>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.record(&event).await;
            }
            debug!("任务事件通道已关闭，审计任务退出");
        })
    }
}
