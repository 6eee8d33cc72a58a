use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单个任务/查询执行失败的分类
///
/// 外部能力（采集器、标注服务）和任务处理器都返回这个类型，
/// 队列和编排器根据分类决定是否重试。
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    /// 网络抖动、服务暂时不可用，可重试
    #[error("暂时性错误: {0}")]
    Transient(String),

    /// 超过单次执行时限，可重试，计入尝试次数
    #[error("执行超时: {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// 输入或响应不合法，不可重试
    #[error("校验失败: {0}")]
    Validation(String),

    /// 配置错误，对整个队列/采集周期是致命的
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 已取消，终态，不计入失败率
    #[error("任务已取消")]
    Cancelled,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// 是否允许按重试策略再次执行
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }

    /// 是否计入告警用的失败统计
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// 用于日志和指标标签的简短分类名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Timeout { .. } => "timeout",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 组件级错误类型定义
#[derive(Debug, Error)]
pub enum SerplineError {
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 查询源暂时不可用，重试之后仍失败
    #[error("查询源 {id} 暂时不可用: {reason}")]
    QuerySourceUnavailable { id: String, reason: String },

    #[error("任务未找到: {id}")]
    JobNotFound { id: String },

    #[error("采集周期配置未找到: {id}")]
    CycleNotFound { id: String },

    #[error("采集执行实例未找到: {id}")]
    ExecutionNotFound { id: String },

    #[error("告警未找到: {id}")]
    AlertNotFound { id: String },

    #[error("任务队列已停止，不再接收新任务")]
    QueueStopped,

    #[error("任务队列因配置错误停止接收新任务: {0}")]
    QueueHalted(String),

    #[error("存储错误: {0}")]
    Repository(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<ExecutionError> for SerplineError {
    fn from(error: ExecutionError) -> Self {
        match error {
            ExecutionError::Configuration(message) => SerplineError::Configuration(message),
            other => SerplineError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SerplineError {
    fn from(error: serde_json::Error) -> Self {
        SerplineError::Serialization(error.to_string())
    }
}

/// 统一的Result类型
pub type SerplineResult<T> = std::result::Result<T, SerplineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecutionError::transient("503").is_retryable());
        assert!(ExecutionError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!ExecutionError::validation("bad").is_retryable());
        assert!(!ExecutionError::configuration("missing").is_retryable());
        assert!(!ExecutionError::Cancelled.is_retryable());
        assert!(!ExecutionError::Cancelled.counts_as_failure());
    }

    #[test]
    fn test_configuration_error_conversion() {
        let error: SerplineError = ExecutionError::configuration("unknown source").into();
        assert!(matches!(error, SerplineError::Configuration(ref m) if m == "unknown source"));

        let error: SerplineError = ExecutionError::transient("reset").into();
        assert!(matches!(error, SerplineError::Internal(_)));
    }

    #[test]
    fn test_execution_error_serialization() {
        let error = ExecutionError::Timeout { timeout_ms: 1500 };
        let json = serde_json::to_string(&error).unwrap();
        let back: ExecutionError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
    }
}
