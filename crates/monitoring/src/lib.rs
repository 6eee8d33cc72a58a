//! 监控与告警
//!
//! 保存指标快照历史，按阈值规则生成告警，汇总各组件的健康状态，
//! 并按保留时长定期清理。

pub mod notification;
pub mod rules;
pub mod service;

pub use notification::{LogNotificationChannel, MemoryNotificationChannel, NotificationChannel};
pub use rules::{AlertCondition, RuleBreach, ThresholdRule};
pub use service::{CleanupReport, MonitoringService};
