//! 阈值告警规则
//!
//! 每次记录指标快照都会逐条评估，分母为零的比率不参与评估。

use serpline_core::config::AlertThresholds;
use serpline_core::models::{AlertContext, AlertSeverity, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCondition {
    GreaterThan,
    LessThan,
}

impl AlertCondition {
    fn check(self, current: f64, threshold: f64) -> bool {
        match self {
            AlertCondition::GreaterThan => current > threshold,
            AlertCondition::LessThan => current < threshold,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            AlertCondition::GreaterThan => "高于",
            AlertCondition::LessThan => "低于",
        }
    }
}

/// 数值在消息里的呈现方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    /// 比率，显示为一位小数的百分比
    Percent,
    Count,
}

impl ValueFormat {
    pub fn render(self, value: f64) -> String {
        match self {
            ValueFormat::Percent => format!("{:.1}%", value * 100.0),
            ValueFormat::Count => format!("{value:.0}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub title: &'static str,
    pub metric: &'static str,
    /// 告警来源
    pub source: &'static str,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub format: ValueFormat,
    extract: fn(&MetricsSnapshot) -> Option<f64>,
}

/// 触发的规则
#[derive(Debug, Clone, PartialEq)]
pub struct RuleBreach {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub source: String,
    pub context: AlertContext,
}

impl ThresholdRule {
    pub fn defaults(thresholds: &AlertThresholds) -> Vec<ThresholdRule> {
        vec![
            ThresholdRule {
                title: "任务失败率过高",
                metric: "scheduler_failure_rate",
                source: "scheduler_metrics",
                condition: AlertCondition::GreaterThan,
                threshold: thresholds.scheduler_failure_rate,
                severity: AlertSeverity::Warning,
                format: ValueFormat::Percent,
                extract: |snapshot| snapshot.scheduler.failure_rate(),
            },
            ThresholdRule {
                title: "队列积压",
                metric: "queue_pending",
                source: "queue_metrics",
                condition: AlertCondition::GreaterThan,
                threshold: thresholds.queue_pending as f64,
                severity: AlertSeverity::Warning,
                format: ValueFormat::Count,
                extract: |snapshot| Some(snapshot.queue.pending as f64),
            },
            ThresholdRule {
                title: "采集成功率过低",
                metric: "collection_success_rate",
                source: "collection_metrics",
                condition: AlertCondition::LessThan,
                threshold: thresholds.collection_success_rate,
                severity: AlertSeverity::Error,
                format: ValueFormat::Percent,
                extract: |snapshot| snapshot.collection.success_rate(),
            },
            ThresholdRule {
                title: "标注错误率过高",
                metric: "annotation_error_rate",
                source: "annotation_metrics",
                condition: AlertCondition::GreaterThan,
                threshold: thresholds.annotation_error_rate,
                severity: AlertSeverity::Warning,
                format: ValueFormat::Percent,
                extract: |snapshot| snapshot.annotation.error_rate(),
            },
        ]
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Option<RuleBreach> {
        let value = (self.extract)(snapshot)?;
        if !self.condition.check(value, self.threshold) {
            return None;
        }
        Some(RuleBreach {
            severity: self.severity,
            title: self.title.to_string(),
            message: format!(
                "{} 为 {}，{}阈值 {}",
                self.metric,
                self.format.render(value),
                self.condition.describe(),
                self.format.render(self.threshold)
            ),
            source: self.source.to_string(),
            context: AlertContext::Threshold {
                metric: self.metric.to_string(),
                value,
                threshold: self.threshold,
            },
        })
    }
}

/// 对快照评估全部规则
pub fn evaluate_all(rules: &[ThresholdRule], snapshot: &MetricsSnapshot) -> Vec<RuleBreach> {
    rules.iter().filter_map(|rule| rule.evaluate(snapshot)).collect()
}
