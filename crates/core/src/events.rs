//! 组件事件
//!
//! 任务队列、标注流水线、采集编排器和监控服务各自发布一种类型化事件，
//! 通过 [`EventBus`] 分发给订阅者。每个订阅者独占一个无界通道，
//! 事件按发布顺序到达，订阅之前发布的事件不会补发。

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::ExecutionError;
use crate::models::{
    Alert, AnnotationResponse, CycleExecution, Fingerprint, HealthCheckResult, JobRecord, Query,
    SearchResult,
};

/// 事件的公共描述
pub trait ComponentEvent {
    /// 事件名，用于日志和指标标签
    fn event_type(&self) -> &'static str;
    /// 事件所属实体的标识
    fn aggregate_id(&self) -> String;
}

/// 进程内事件总线
#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// 发布事件，顺带清理已关闭的订阅者
    pub fn publish(&self, event: E) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// 任务队列事件，`O` 是任务处理器的输出类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent<O> {
    #[serde(rename = "job_submitted")]
    Submitted { job: JobRecord },
    #[serde(rename = "job_started")]
    Started { job: JobRecord },
    #[serde(rename = "job_succeeded")]
    Succeeded { job: JobRecord, output: O },
    #[serde(rename = "job_retrying")]
    Retrying {
        job: JobRecord,
        error: ExecutionError,
        delay_ms: u64,
    },
    #[serde(rename = "job_failed")]
    Failed { job: JobRecord, error: ExecutionError },
    #[serde(rename = "job_cancelled")]
    Cancelled { job: JobRecord },
    #[serde(rename = "queue_halted")]
    Halted { reason: String },
}

impl<O> QueueEvent<O> {
    pub fn job(&self) -> Option<&JobRecord> {
        match self {
            QueueEvent::Submitted { job }
            | QueueEvent::Started { job }
            | QueueEvent::Succeeded { job, .. }
            | QueueEvent::Retrying { job, .. }
            | QueueEvent::Failed { job, .. }
            | QueueEvent::Cancelled { job } => Some(job),
            QueueEvent::Halted { .. } => None,
        }
    }
}

impl<O> ComponentEvent for QueueEvent<O> {
    fn event_type(&self) -> &'static str {
        match self {
            QueueEvent::Submitted { .. } => "job_submitted",
            QueueEvent::Started { .. } => "job_started",
            QueueEvent::Succeeded { .. } => "job_succeeded",
            QueueEvent::Retrying { .. } => "job_retrying",
            QueueEvent::Failed { .. } => "job_failed",
            QueueEvent::Cancelled { .. } => "job_cancelled",
            QueueEvent::Halted { .. } => "queue_halted",
        }
    }

    fn aggregate_id(&self) -> String {
        match self.job() {
            Some(job) => job.id.to_string(),
            None => "queue".to_string(),
        }
    }
}

/// 标注流水线事件，每个等待中的条目各收到一条
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnnotationEvent {
    #[serde(rename = "annotation_cached")]
    Cached {
        item_id: String,
        fingerprint: Fingerprint,
        result: AnnotationResponse,
    },
    #[serde(rename = "annotation_processed")]
    Processed {
        item_id: String,
        fingerprint: Fingerprint,
        result: AnnotationResponse,
    },
    #[serde(rename = "annotation_failed")]
    Failed {
        item_id: String,
        fingerprint: Fingerprint,
        error: ExecutionError,
        attempts: u32,
    },
    /// 流水线停止或任务被取消，不计为失败
    #[serde(rename = "annotation_cancelled")]
    Cancelled {
        item_id: String,
        fingerprint: Fingerprint,
    },
}

impl AnnotationEvent {
    pub fn item_id(&self) -> &str {
        match self {
            AnnotationEvent::Cached { item_id, .. }
            | AnnotationEvent::Processed { item_id, .. }
            | AnnotationEvent::Failed { item_id, .. }
            | AnnotationEvent::Cancelled { item_id, .. } => item_id,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            AnnotationEvent::Cached { fingerprint, .. }
            | AnnotationEvent::Processed { fingerprint, .. }
            | AnnotationEvent::Failed { fingerprint, .. }
            | AnnotationEvent::Cancelled { fingerprint, .. } => fingerprint,
        }
    }
}

impl ComponentEvent for AnnotationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AnnotationEvent::Cached { .. } => "annotation_cached",
            AnnotationEvent::Processed { .. } => "annotation_processed",
            AnnotationEvent::Failed { .. } => "annotation_failed",
            AnnotationEvent::Cancelled { .. } => "annotation_cancelled",
        }
    }

    fn aggregate_id(&self) -> String {
        self.item_id().to_string()
    }
}

/// 采集周期事件，均携带事件发生时的执行快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    #[serde(rename = "cycle_started")]
    Started { execution: CycleExecution },
    #[serde(rename = "query_collected")]
    QueryCollected {
        execution: CycleExecution,
        query: Query,
        engine: String,
        results: Vec<SearchResult>,
    },
    #[serde(rename = "query_failed")]
    QueryFailed {
        execution: CycleExecution,
        query: Query,
        engine: String,
        error: ExecutionError,
    },
    #[serde(rename = "cycle_completed")]
    Completed { execution: CycleExecution },
    #[serde(rename = "cycle_failed")]
    Failed {
        execution: CycleExecution,
        error: String,
    },
    #[serde(rename = "cycle_cancelled")]
    Cancelled { execution: CycleExecution },
}

impl CycleEvent {
    pub fn execution(&self) -> &CycleExecution {
        match self {
            CycleEvent::Started { execution }
            | CycleEvent::QueryCollected { execution, .. }
            | CycleEvent::QueryFailed { execution, .. }
            | CycleEvent::Completed { execution }
            | CycleEvent::Failed { execution, .. }
            | CycleEvent::Cancelled { execution } => execution,
        }
    }
}

impl ComponentEvent for CycleEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CycleEvent::Started { .. } => "cycle_started",
            CycleEvent::QueryCollected { .. } => "query_collected",
            CycleEvent::QueryFailed { .. } => "query_failed",
            CycleEvent::Completed { .. } => "cycle_completed",
            CycleEvent::Failed { .. } => "cycle_failed",
            CycleEvent::Cancelled { .. } => "cycle_cancelled",
        }
    }

    fn aggregate_id(&self) -> String {
        self.execution().id.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitoringEvent {
    AlertCreated { alert: Alert },
    AlertAcknowledged { alert: Alert },
    HealthCheckUpdated { result: HealthCheckResult },
}

impl ComponentEvent for MonitoringEvent {
    fn event_type(&self) -> &'static str {
        match self {
            MonitoringEvent::AlertCreated { .. } => "alert_created",
            MonitoringEvent::AlertAcknowledged { .. } => "alert_acknowledged",
            MonitoringEvent::HealthCheckUpdated { .. } => "health_check_updated",
        }
    }

    fn aggregate_id(&self) -> String {
        match self {
            MonitoringEvent::AlertCreated { alert }
            | MonitoringEvent::AlertAcknowledged { alert } => alert.id.to_string(),
            MonitoringEvent::HealthCheckUpdated { result } => result.component.clone(),
        }
    }
}
