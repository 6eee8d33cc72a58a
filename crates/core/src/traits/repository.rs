//! 持久化接口
//!
//! 核心组件只依赖这几个按键读写的窄接口，具体存储由宿主提供。
//! `serpline-infrastructure` 中有基于内存的参考实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SerplineResult;
use crate::models::{
    Alert, AlertFilter, AlertId, CacheEntry, CycleExecution, ExecutionId, Fingerprint,
    HealthCheckResult, JobId, JobRecord,
};

/// 任务记录仓储
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 不存在时创建，存在时覆盖
    async fn upsert(&self, record: &JobRecord) -> SerplineResult<()>;

    async fn find(&self, id: JobId) -> SerplineResult<Option<JobRecord>>;

    async fn list(&self) -> SerplineResult<Vec<JobRecord>>;
}

/// 标注缓存仓储
#[async_trait]
pub trait CacheEntryRepository: Send + Sync {
    async fn put(&self, entry: &CacheEntry) -> SerplineResult<()>;

    async fn find(&self, fingerprint: &Fingerprint) -> SerplineResult<Option<CacheEntry>>;

    /// 写入时间不早于 `since` 的条目，用于预热缓存
    async fn list_since(&self, since: DateTime<Utc>) -> SerplineResult<Vec<CacheEntry>>;

    async fn delete(&self, fingerprint: &Fingerprint) -> SerplineResult<bool>;
}

/// 采集执行仓储
#[async_trait]
pub trait CycleExecutionRepository: Send + Sync {
    async fn create(&self, execution: &CycleExecution) -> SerplineResult<()>;

    async fn update(&self, execution: &CycleExecution) -> SerplineResult<()>;

    async fn find(&self, id: ExecutionId) -> SerplineResult<Option<CycleExecution>>;

    async fn list_by_config(&self, cycle_config_id: &str) -> SerplineResult<Vec<CycleExecution>>;
}

/// 告警仓储
#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn create(&self, alert: &Alert) -> SerplineResult<()>;

    async fn update(&self, alert: &Alert) -> SerplineResult<()>;

    async fn find(&self, id: AlertId) -> SerplineResult<Option<Alert>>;

    async fn query(&self, filter: &AlertFilter) -> SerplineResult<Vec<Alert>>;

    /// 删除早于 `before` 的告警，返回删除数量
    async fn delete_before(&self, before: DateTime<Utc>) -> SerplineResult<usize>;
}

/// 健康检查仓储，每个组件只保留最新结果
#[async_trait]
pub trait HealthCheckRepository: Send + Sync {
    async fn upsert(&self, result: &HealthCheckResult) -> SerplineResult<()>;

    async fn find(&self, component: &str) -> SerplineResult<Option<HealthCheckResult>>;

    async fn list(&self) -> SerplineResult<Vec<HealthCheckResult>>;
}
