use anyhow::{anyhow, Result};
use serpline_core::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化结构化日志
///
/// `RUST_LOG` 优先于配置中的级别。全局订阅者只能设置一次，重复调用返回错误。
pub fn init_structured_logging(config: &LoggingConfig) -> Result<()> {
    config.validate()?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_lowercase()))
        .map_err(|e| anyhow!("无效的日志过滤器: {e}"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_thread_ids(config.include_thread_ids),
            )
            .try_init(),
        "compact" => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_thread_ids(config.include_thread_ids),
            )
            .try_init(),
        _ => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_thread_ids(config.include_thread_ids),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow!("日志系统初始化失败: {e}"))?;

    tracing::info!(
        level = %config.level,
        format = %config.format,
        "结构化日志已初始化"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_format_is_rejected() {
        let config = LoggingConfig {
            format: "xml".to_string(),
            ..Default::default()
        };
        assert!(init_structured_logging(&config).is_err());
    }
}
