use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 任务队列配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 并发执行的 worker 数
    pub concurrency: usize,
    /// 首次执行之后允许的重试次数
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// 重试延迟的随机抖动比例，0 表示不抖动
    pub jitter_factor: f64,
    pub default_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 60_000,
            jitter_factor: 0.0,
            default_timeout_ms: 30_000,
        }
    }
}

impl QueueConfig {
    /// 未显式指定时任务的最大尝试次数
    pub fn default_max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("队列并发数必须大于0"));
        }
        if self.retry_delay_ms == 0 {
            return Err(anyhow::anyhow!("重试延迟必须大于0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "退避倍数不能小于1: {}",
                self.backoff_multiplier
            ));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(anyhow::anyhow!(
                "最大重试延迟 {}ms 不能小于基础延迟 {}ms",
                self.max_retry_delay_ms,
                self.retry_delay_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!(
                "抖动比例必须在0到1之间: {}",
                self.jitter_factor
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(anyhow::anyhow!("任务默认超时时间必须大于0"));
        }
        Ok(())
    }
}
