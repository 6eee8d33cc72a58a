//! 基于内存的仓储实现
//!
//! 适用于嵌入式部署和测试，进程退出后数据丢失。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serpline_core::errors::{SerplineError, SerplineResult};
use serpline_core::models::{
    Alert, AlertFilter, AlertId, CacheEntry, CycleExecution, ExecutionId, Fingerprint,
    HealthCheckResult, JobId, JobRecord,
};
use serpline_core::traits::{
    AlertRepository, CacheEntryRepository, CycleExecutionRepository, HealthCheckRepository,
    JobRepository,
};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn upsert(&self, record: &JobRecord) -> SerplineResult<()> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn find(&self, id: JobId) -> SerplineResult<Option<JobRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> SerplineResult<Vec<JobRecord>> {
        let mut records: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCacheEntryRepository {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl InMemoryCacheEntryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheEntryRepository for InMemoryCacheEntryRepository {
    async fn put(&self, entry: &CacheEntry) -> SerplineResult<()> {
        self.entries
            .write()
            .await
            .insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }

    async fn find(&self, fingerprint: &Fingerprint) -> SerplineResult<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(fingerprint).cloned())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> SerplineResult<Vec<CacheEntry>> {
        let mut entries: Vec<CacheEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.written_at >= since)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.written_at);
        Ok(entries)
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> SerplineResult<bool> {
        Ok(self.entries.write().await.remove(fingerprint).is_some())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCycleExecutionRepository {
    executions: RwLock<HashMap<ExecutionId, CycleExecution>>,
}

impl InMemoryCycleExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CycleExecutionRepository for InMemoryCycleExecutionRepository {
    async fn create(&self, execution: &CycleExecution) -> SerplineResult<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(SerplineError::Repository(format!(
                "采集执行已存在: {}",
                execution.id
            )));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &CycleExecution) -> SerplineResult<()> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.id) {
            Some(stored) => {
                *stored = execution.clone();
                Ok(())
            }
            None => Err(SerplineError::ExecutionNotFound {
                id: execution.id.to_string(),
            }),
        }
    }

    async fn find(&self, id: ExecutionId) -> SerplineResult<Option<CycleExecution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn list_by_config(&self, cycle_config_id: &str) -> SerplineResult<Vec<CycleExecution>> {
        let mut executions: Vec<CycleExecution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|execution| execution.cycle_config_id == cycle_config_id)
            .cloned()
            .collect();
        executions.sort_by_key(|execution| execution.started_at);
        Ok(executions)
    }
}

/// 告警按创建顺序保存
#[derive(Debug, Default)]
pub struct InMemoryAlertRepository {
    alerts: RwLock<Vec<Alert>>,
}

impl InMemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn create(&self, alert: &Alert) -> SerplineResult<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn update(&self, alert: &Alert) -> SerplineResult<()> {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|stored| stored.id == alert.id) {
            Some(stored) => {
                *stored = alert.clone();
                Ok(())
            }
            None => Err(SerplineError::AlertNotFound {
                id: alert.id.to_string(),
            }),
        }
    }

    async fn find(&self, id: AlertId) -> SerplineResult<Option<Alert>> {
        Ok(self
            .alerts
            .read()
            .await
            .iter()
            .find(|alert| alert.id == id)
            .cloned())
    }

    /// 最新的在前
    async fn query(&self, filter: &AlertFilter) -> SerplineResult<Vec<Alert>> {
        Ok(self
            .alerts
            .read()
            .await
            .iter()
            .rev()
            .filter(|alert| filter.matches(alert))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn delete_before(&self, before: DateTime<Utc>) -> SerplineResult<usize> {
        let mut alerts = self.alerts.write().await;
        let count = alerts.len();
        alerts.retain(|alert| alert.timestamp >= before);
        Ok(count - alerts.len())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryHealthCheckRepository {
    results: RwLock<HashMap<String, HealthCheckResult>>,
}

impl InMemoryHealthCheckRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthCheckRepository for InMemoryHealthCheckRepository {
    async fn upsert(&self, result: &HealthCheckResult) -> SerplineResult<()> {
        self.results
            .write()
            .await
            .insert(result.component.clone(), result.clone());
        Ok(())
    }

    async fn find(&self, component: &str) -> SerplineResult<Option<HealthCheckResult>> {
        Ok(self.results.read().await.get(component).cloned())
    }

    async fn list(&self) -> SerplineResult<Vec<HealthCheckResult>> {
        let mut results: Vec<HealthCheckResult> =
            self.results.read().await.values().cloned().collect();
        results.sort_by(|a, b| a.component.cmp(&b.component));
        Ok(results)
    }
}
