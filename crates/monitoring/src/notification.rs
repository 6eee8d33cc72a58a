use std::sync::{Arc, Mutex};

use anyhow::Result;
use serpline_core::models::{Alert, AlertSeverity};
use tracing::{error, info, warn};

/// 告警通知渠道
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    fn send_alert(&self, alert: &Alert) -> Result<()>;
}

/// 把告警写入日志，级别随告警严重程度变化
pub struct LogNotificationChannel {
    name: String,
}

impl LogNotificationChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl NotificationChannel for LogNotificationChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_alert(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Info => info!(
                channel = %self.name,
                alert_id = %alert.id,
                source = %alert.source,
                title = %alert.title,
                message = %alert.message,
                "告警通知"
            ),
            AlertSeverity::Warning => warn!(
                channel = %self.name,
                alert_id = %alert.id,
                source = %alert.source,
                title = %alert.title,
                message = %alert.message,
                "告警通知"
            ),
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                channel = %self.name,
                alert_id = %alert.id,
                severity = alert.severity.as_str(),
                source = %alert.source,
                title = %alert.title,
                message = %alert.message,
                "告警通知"
            ),
        }
        Ok(())
    }
}

/// 在内存中记录收到的告警，供嵌入方轮询或测试断言
#[derive(Default)]
pub struct MemoryNotificationChannel {
    received: Mutex<Vec<Alert>>,
}

impl MemoryNotificationChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Alert> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl NotificationChannel for MemoryNotificationChannel {
    fn name(&self) -> &str {
        "memory"
    }

    fn send_alert(&self, alert: &Alert) -> Result<()> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alert.clone());
        Ok(())
    }
}
