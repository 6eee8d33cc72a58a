use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::{
    annotation::AnnotationConfig, collection::CollectionConfig, logging::LoggingConfig,
    monitoring::MonitoringConfig, queue::QueueConfig,
};

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub annotation: AnnotationConfig,
    pub collection: CollectionConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: SERPLINE_, nested keys joined by `__`,
    ///    e.g. `SERPLINE_QUEUE__CONCURRENCY=8`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default())
            .context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                debug!(path, "加载配置文件");
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/serpline.toml", "serpline.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                debug!(path = *path, "加载默认位置的配置文件");
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SERPLINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate().context("任务队列配置验证失败")?;
        self.annotation
            .validate()
            .context("标注流水线配置验证失败")?;
        self.collection.validate().context("采集配置验证失败")?;
        self.monitoring.validate().context("监控配置验证失败")?;
        self.logging.validate().context("日志配置验证失败")?;
        Ok(())
    }
}
