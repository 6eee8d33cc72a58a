use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::annotation::AnnotationItem;
use super::job::JobPriority;
use crate::errors::{SerplineError, SerplineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 每次执行从查询源中挑选查询的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// 按顺序滑动窗口，游标跨执行保留
    #[default]
    Sequential,
    /// 均匀随机抽样
    Random,
    /// 各类别轮流抽取
    CategoryBalanced,
}

/// 采集周期定义，注册后不可变，重新注册即替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    pub id: String,
    pub name: String,
    pub query_source_id: String,
    pub engines: Vec<String>,
    pub query_count: usize,
    #[serde(default)]
    pub rotation_strategy: RotationStrategy,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub retry_attempts: u32,
    pub per_engine_timeout_ms: u64,
}

impl CycleConfig {
    pub fn validate(&self) -> SerplineResult<()> {
        if self.id.trim().is_empty() {
            return Err(SerplineError::Configuration("采集周期ID不能为空".to_string()));
        }
        if self.query_source_id.trim().is_empty() {
            return Err(SerplineError::Configuration(format!(
                "采集周期 {} 未指定查询源",
                self.id
            )));
        }
        if self.engines.is_empty() {
            return Err(SerplineError::Configuration(format!(
                "采集周期 {} 至少需要一个搜索引擎",
                self.id
            )));
        }
        if self.engines.iter().any(|engine| engine.trim().is_empty()) {
            return Err(SerplineError::Configuration(format!(
                "采集周期 {} 包含空的引擎名称",
                self.id
            )));
        }
        if self.query_count == 0 {
            return Err(SerplineError::Configuration(format!(
                "采集周期 {} 的查询数量必须大于0",
                self.id
            )));
        }
        if self.per_engine_timeout_ms == 0 {
            return Err(SerplineError::Configuration(format!(
                "采集周期 {} 的单引擎超时时间必须大于0",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CycleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CycleStatus::Completed | CycleStatus::Failed | CycleStatus::Cancelled
        )
    }
}

/// 进度计数，单位是 查询×引擎 组合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleProgress {
    pub total_queries: usize,
    pub completed_queries: usize,
    pub failed_queries: usize,
    pub total_results: usize,
}

impl CycleProgress {
    pub fn resolved(&self) -> usize {
        self.completed_queries + self.failed_queries
    }

    pub fn is_finished(&self) -> bool {
        self.resolved() >= self.total_queries
    }

    pub fn success_rate(&self) -> Option<f64> {
        let resolved = self.resolved();
        if resolved == 0 {
            None
        } else {
            Some(self.completed_queries as f64 / resolved as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleErrorEntry {
    pub query: String,
    pub engine: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// 一次采集周期的运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleExecution {
    pub id: ExecutionId,
    pub cycle_config_id: String,
    pub status: CycleStatus,
    pub progress: CycleProgress,
    pub errors: Vec<CycleErrorEntry>,
    pub correlation_id: String,
    /// 整个执行失败时的原因
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CycleExecution {
    pub fn new(cycle_config_id: impl Into<String>) -> Self {
        let id = ExecutionId::new();
        Self {
            id,
            cycle_config_id: cycle_config_id.into(),
            status: CycleStatus::Pending,
            progress: CycleProgress::default(),
            errors: Vec::new(),
            correlation_id: id.to_string(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 状态迁移，终态不可离开
    pub fn transition(&mut self, to: CycleStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || self.status == to {
            return false;
        }
        self.status = to;
        match to {
            CycleStatus::Running => self.started_at = Some(now),
            CycleStatus::Completed | CycleStatus::Failed | CycleStatus::Cancelled => {
                self.completed_at = Some(now)
            }
            CycleStatus::Pending => {}
        }
        true
    }
}

/// 查询源中的一条查询
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub text: String,
    pub category: Option<String>,
}

impl Query {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// 采集器返回的一条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub engine: String,
    pub query_id: String,
    pub rank: u32,
    pub title: String,
    pub snippet: String,
    pub url: String,
}

impl SearchResult {
    pub fn to_annotation_item(&self, query: &Query) -> AnnotationItem {
        AnnotationItem {
            id: format!("{}:{}:{}", self.engine, self.query_id, self.rank),
            title: self.title.clone(),
            snippet: self.snippet.clone(),
            url: self.url.clone(),
            query: Some(query.text.clone()),
            engine: Some(self.engine.clone()),
        }
    }
}
