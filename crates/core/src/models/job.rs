use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// 数值越小优先级越高
    pub fn rank(self) -> u8 {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// 任务队列中的一个可重试工作单元
///
/// 状态只能单向流转：`Pending ⇄ Running → {Succeeded, Failed, Cancelled}`，
/// 进入终态后任何迁移都会被拒绝。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<P> {
    pub id: JobId,
    pub payload: P,
    pub priority: JobPriority,
    pub state: JobState,
    /// 已失败的尝试次数
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub next_eligible_at: DateTime<Utc>,
    pub correlation_id: String,
    pub last_error: Option<ExecutionError>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl<P> Job<P> {
    pub fn new(
        payload: P,
        priority: JobPriority,
        max_attempts: u32,
        timeout: Duration,
        correlation_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            payload,
            priority,
            state: JobState::Pending,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            timeout_ms: timeout.as_millis() as u64,
            next_eligible_at: now,
            correlation_id,
            last_error: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && !self.cancel_requested && self.next_eligible_at <= now
    }

    /// 还有剩余尝试次数
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// 执行状态迁移，终态不可离开
    pub fn transition(&mut self, to: JobState, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = to;
        self.updated_at = now;
        match to {
            JobState::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => {
                self.completed_at = Some(now);
            }
            JobState::Pending => {}
        }
        true
    }

    /// 去掉负载的快照，用于持久化和审计
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            priority: self.priority,
            state: self.state,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            timeout_ms: self.timeout_ms,
            next_eligible_at: self.next_eligible_at,
            correlation_id: self.correlation_id.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub next_eligible_at: DateTime<Utc>,
    pub correlation_id: String,
    pub last_error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
