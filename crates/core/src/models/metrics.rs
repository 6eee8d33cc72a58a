use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

impl SchedulerMetrics {
    /// 失败率，已取消的任务不计入分母
    pub fn failure_rate(&self) -> Option<f64> {
        ratio(self.failed, self.succeeded + self.failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: u64,
    pub running: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionMetrics {
    pub total_queries: u64,
    pub completed_queries: u64,
    pub failed_queries: u64,
    pub total_results: u64,
}

impl CollectionMetrics {
    pub fn success_rate(&self) -> Option<f64> {
        ratio(
            self.completed_queries,
            self.completed_queries + self.failed_queries,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnnotationMetrics {
    pub processed: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl AnnotationMetrics {
    pub fn error_rate(&self) -> Option<f64> {
        ratio(self.failed, self.processed + self.failed)
    }

    pub fn cache_hit_rate(&self) -> Option<f64> {
        ratio(self.cache_hits, self.cache_hits + self.cache_misses)
    }
}

/// 某一时刻的系统指标快照，由监控服务保存并用于阈值规则判断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub scheduler: SchedulerMetrics,
    #[serde(default)]
    pub queue: QueueMetrics,
    #[serde(default)]
    pub collection: CollectionMetrics,
    #[serde(default)]
    pub annotation: AnnotationMetrics,
}

impl MetricsSnapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            scheduler: SchedulerMetrics::default(),
            queue: QueueMetrics::default(),
            collection: CollectionMetrics::default(),
            annotation: AnnotationMetrics::default(),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_denominator_yields_none() {
        assert_eq!(SchedulerMetrics::default().failure_rate(), None);
        assert_eq!(CollectionMetrics::default().success_rate(), None);
        assert_eq!(AnnotationMetrics::default().error_rate(), None);
    }

    #[test]
    fn test_cancelled_excluded_from_failure_rate() {
        let scheduler = SchedulerMetrics {
            succeeded: 3,
            failed: 1,
            cancelled: 100,
            retried: 0,
        };
        assert_eq!(scheduler.failure_rate(), Some(0.25));
    }
}
