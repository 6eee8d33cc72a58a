use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::health::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// 告警的结构化上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertContext {
    /// 阈值规则触发
    Threshold {
        metric: String,
        value: f64,
        threshold: f64,
    },
    /// 组件健康检查失败
    HealthCheck {
        component: String,
        status: HealthStatus,
    },
    /// 调用方手动创建
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub context: AlertContext,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
        context: AlertContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            severity,
            title: title.into(),
            message: message.into(),
            source: source.into(),
            timestamp: now,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            context,
        }
    }

    /// 确认告警，已确认的告警返回 false
    pub fn acknowledge(&mut self, by: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.acknowledged {
            return false;
        }
        self.acknowledged = true;
        self.acknowledged_by = Some(by.into());
        self.acknowledged_at = Some(now);
        true
    }
}

/// 告警查询条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub severity: Option<AlertSeverity>,
    pub source: Option<String>,
    pub acknowledged: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        if let Some(severity) = self.severity {
            if alert.severity != severity {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &alert.source != source {
                return false;
            }
        }
        if let Some(acknowledged) = self.acknowledged {
            if alert.acknowledged != acknowledged {
                return false;
            }
        }
        if let Some(since) = self.since {
            if alert.timestamp < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_only_once() {
        let now = Utc::now();
        let mut alert = Alert::new(
            AlertSeverity::Warning,
            "队列积压",
            "pending 1200",
            "queue_metrics",
            AlertContext::Manual,
            now,
        );
        assert!(alert.acknowledge("ops", now));
        assert!(!alert.acknowledge("someone-else", now));
        assert_eq!(alert.acknowledged_by.as_deref(), Some("ops"));
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let alert = Alert::new(
            AlertSeverity::Error,
            "t",
            "m",
            "collection_metrics",
            AlertContext::Manual,
            now,
        );
        let filter = AlertFilter {
            severity: Some(AlertSeverity::Error),
            source: Some("collection_metrics".to_string()),
            acknowledged: Some(false),
            ..Default::default()
        };
        assert!(filter.matches(&alert));

        let other = AlertFilter {
            source: Some("queue_metrics".to_string()),
            ..Default::default()
        };
        assert!(!other.matches(&alert));
    }
}
