use serde::{Deserialize, Serialize};

/// 标注流水线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub cache_max_size: usize,
    pub cache_ttl_ms: u64,
    pub batch_size: usize,
    /// 批次从第一条请求开始最多等待的时间
    pub processing_interval_ms: u64,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    /// 单条请求的估算 token 数，用于 tokens_per_minute 限流
    pub estimated_tokens_per_item: u32,
    pub request_timeout_ms: u64,
    /// 外部命令标注服务，未配置时由宿主注入其他实现
    pub command: Option<CommandProviderConfig>,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            cache_max_size: 10_000,
            cache_ttl_ms: 24 * 60 * 60 * 1000,
            batch_size: 10,
            processing_interval_ms: 1_000,
            requests_per_minute: 50,
            tokens_per_minute: 40_000,
            estimated_tokens_per_item: 500,
            request_timeout_ms: 60_000,
            command: None,
        }
    }
}

impl AnnotationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache_max_size == 0 {
            return Err(anyhow::anyhow!("缓存容量必须大于0"));
        }
        if self.cache_ttl_ms == 0 {
            return Err(anyhow::anyhow!("缓存TTL必须大于0"));
        }
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("批次大小必须大于0"));
        }
        if self.processing_interval_ms == 0 {
            return Err(anyhow::anyhow!("批处理间隔必须大于0"));
        }
        if self.requests_per_minute == 0 || self.tokens_per_minute == 0 {
            return Err(anyhow::anyhow!("限流配额必须大于0"));
        }
        if self.estimated_tokens_per_item > self.tokens_per_minute {
            return Err(anyhow::anyhow!(
                "单条请求估算token数 {} 超过每分钟配额 {}",
                self.estimated_tokens_per_item,
                self.tokens_per_minute
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("标注请求超时时间必须大于0"));
        }
        if let Some(command) = &self.command {
            command.validate()?;
        }
        Ok(())
    }
}

/// 外部命令标注服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandProviderConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    120_000
}

impl CommandProviderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow::anyhow!("标注命令不能为空"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow::anyhow!("标注模型名称不能为空"));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow::anyhow!("标注命令超时时间必须大于0"));
        }
        Ok(())
    }
}
