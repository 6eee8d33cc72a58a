use serde::{Deserialize, Serialize};

/// 采集编排配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// 同时在途的 查询×引擎 组合数
    pub max_concurrent_collections: usize,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// 成功率低于该值时执行判定为失败；未设置时只有全部失败才判定失败
    pub min_success_rate: Option<f64>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_collections: 4,
            retry_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            min_success_rate: None,
        }
    }
}

impl CollectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_collections == 0 {
            return Err(anyhow::anyhow!("最大并发采集数必须大于0"));
        }
        if self.retry_delay_ms == 0 {
            return Err(anyhow::anyhow!("采集重试延迟必须大于0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "采集退避倍数不能小于1: {}",
                self.backoff_multiplier
            ));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(anyhow::anyhow!("采集最大重试延迟不能小于基础延迟"));
        }
        if let Some(rate) = self.min_success_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(anyhow::anyhow!("最低成功率必须在0到1之间: {}", rate));
            }
        }
        Ok(())
    }
}
