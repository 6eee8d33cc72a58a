use serde::{Deserialize, Serialize};

/// 监控与告警配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub alert_retention_hours: u64,
    pub metrics_retention_hours: u64,
    pub cleanup_interval_seconds: u64,
    /// 应用层采集指标快照的间隔
    pub sample_interval_seconds: u64,
    pub thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            alert_retention_hours: 24 * 7,
            metrics_retention_hours: 24,
            cleanup_interval_seconds: 3_600,
            sample_interval_seconds: 60,
            thresholds: AlertThresholds::default(),
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.alert_retention_hours == 0 {
            return Err(anyhow::anyhow!("告警保留时长必须大于0"));
        }
        if self.metrics_retention_hours == 0 {
            return Err(anyhow::anyhow!("指标保留时长必须大于0"));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }
        if self.sample_interval_seconds == 0 {
            return Err(anyhow::anyhow!("指标采样间隔必须大于0"));
        }
        self.thresholds.validate()
    }
}

/// 阈值告警规则的阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub scheduler_failure_rate: f64,
    pub queue_pending: u64,
    pub collection_success_rate: f64,
    pub annotation_error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            scheduler_failure_rate: 0.2,
            queue_pending: 1_000,
            collection_success_rate: 0.8,
            annotation_error_rate: 0.1,
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("scheduler_failure_rate", self.scheduler_failure_rate),
            ("collection_success_rate", self.collection_success_rate),
            ("annotation_error_rate", self.annotation_error_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("阈值 {} 必须在0到1之间: {}", name, value));
            }
        }
        Ok(())
    }
}
