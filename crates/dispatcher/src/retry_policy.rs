use std::time::Duration;

use serde::{Deserialize, Serialize};
use serpline_core::config::{CollectionConfig, QueueConfig};

/// 指数退避重试策略，任务队列和采集编排器共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            base_delay_ms: config.retry_delay_ms,
            multiplier: config.backoff_multiplier,
            max_delay_ms: config.max_retry_delay_ms,
            jitter_factor: config.jitter_factor,
        }
    }

    pub fn from_collection_config(config: &CollectionConfig) -> Self {
        Self {
            base_delay_ms: config.retry_delay_ms,
            multiplier: config.backoff_multiplier,
            max_delay_ms: config.max_retry_delay_ms,
            jitter_factor: 0.0,
        }
    }

    /// 第 `attempt` 次失败之后的等待时间
    ///
    /// `min(base * multiplier^attempt, max)`，抖动之后仍限制在 `[0, max]` 之内。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;

        let exponent = attempt.min(i32::MAX as u32) as i32;
        let exponential = base * self.multiplier.powi(exponent);
        let capped = if exponential.is_finite() {
            exponential.min(max)
        } else {
            max
        };

        let delay = if self.jitter_factor > 0.0 {
            let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
            (capped + jitter).clamp(0.0, max)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }
}
