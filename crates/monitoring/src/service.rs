use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serpline_core::clock::Clock;
use serpline_core::config::MonitoringConfig;
use serpline_core::errors::SerplineResult;
use serpline_core::events::{EventBus, MonitoringEvent};
use serpline_core::models::{
    Alert, AlertContext, AlertFilter, AlertId, AlertSeverity, HealthCheckResult, HealthStatus,
    MetricsSnapshot, SystemHealth,
};
use serpline_core::traits::{AlertRepository, HealthCheckRepository};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::notification::NotificationChannel;
use crate::rules::{evaluate_all, ThresholdRule};

/// 一次清理删除的数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub alerts_removed: usize,
    pub metrics_removed: usize,
}

#[derive(Default)]
struct MonitoringState {
    /// 按创建顺序保存
    alerts: Vec<Alert>,
    health: BTreeMap<String, HealthCheckResult>,
    history: VecDeque<MetricsSnapshot>,
}

struct MonitoringInner {
    config: MonitoringConfig,
    clock: Arc<dyn Clock>,
    rules: Vec<ThresholdRule>,
    state: Mutex<MonitoringState>,
    events: EventBus<MonitoringEvent>,
    channels: Mutex<Vec<Arc<dyn NotificationChannel>>>,
    alert_repository: OnceLock<Arc<dyn AlertRepository>>,
    health_repository: OnceLock<Arc<dyn HealthCheckRepository>>,
}

/// 指标历史、阈值告警和组件健康状态
#[derive(Clone)]
pub struct MonitoringService {
    inner: Arc<MonitoringInner>,
}

impl MonitoringService {
    pub fn new(config: MonitoringConfig, clock: Arc<dyn Clock>) -> Self {
        let rules = ThresholdRule::defaults(&config.thresholds);
        Self {
            inner: Arc::new(MonitoringInner {
                config,
                clock,
                rules,
                state: Mutex::new(MonitoringState::default()),
                events: EventBus::new(),
                channels: Mutex::new(Vec::new()),
                alert_repository: OnceLock::new(),
                health_repository: OnceLock::new(),
            }),
        }
    }

    pub fn with_alert_repository(self, repository: Arc<dyn AlertRepository>) -> Self {
        if self.inner.alert_repository.set(repository).is_err() {
            warn!("告警仓储已设置，忽略重复设置");
        }
        self
    }

    pub fn with_health_repository(self, repository: Arc<dyn HealthCheckRepository>) -> Self {
        if self.inner.health_repository.set(repository).is_err() {
            warn!("健康检查仓储已设置，忽略重复设置");
        }
        self
    }

    pub fn add_notification_channel(&self, channel: Arc<dyn NotificationChannel>) {
        info!(channel = channel.name(), "添加告警通知渠道");
        lock(&self.inner.channels).push(channel);
    }

    /// 保存指标快照并评估阈值规则，返回本次创建的告警
    pub async fn record_metrics(&self, snapshot: MetricsSnapshot) -> Vec<AlertId> {
        let breaches = evaluate_all(&self.inner.rules, &snapshot);
        lock(&self.inner.state).history.push_back(snapshot);

        let mut created = Vec::with_capacity(breaches.len());
        for breach in breaches {
            created.push(
                self.create_alert(
                    breach.severity,
                    breach.title,
                    breach.message,
                    breach.source,
                    breach.context,
                )
                .await,
            );
        }
        created
    }

    /// 更新组件健康状态，后到的结果覆盖之前的；不健康时创建 Error 告警
    pub async fn update_health_check(&self, result: HealthCheckResult) -> Option<AlertId> {
        let previous = lock(&self.inner.state)
            .health
            .insert(result.component.clone(), result.clone())
            .map(|previous| previous.status);
        if previous != Some(result.status) {
            info!(
                component = %result.component,
                status = result.status.as_str(),
                "组件健康状态变化"
            );
        }
        self.inner.events.publish(MonitoringEvent::HealthCheckUpdated {
            result: result.clone(),
        });

        if let Some(repository) = self.inner.health_repository.get() {
            if let Err(e) = repository.upsert(&result).await {
                warn!(component = %result.component, "保存健康检查结果失败: {e}");
            }
        }

        if result.status != HealthStatus::Unhealthy {
            return None;
        }
        let alert_id = self
            .create_alert(
                AlertSeverity::Error,
                format!("组件 {} 不健康", result.component),
                result.message.clone(),
                result.component.clone(),
                AlertContext::HealthCheck {
                    component: result.component.clone(),
                    status: result.status,
                },
            )
            .await;
        Some(alert_id)
    }

    pub async fn create_alert(
        &self,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
        context: AlertContext,
    ) -> AlertId {
        let alert = Alert::new(
            severity,
            title,
            message,
            source,
            context,
            self.inner.clock.now(),
        );
        let alert_id = alert.id;
        debug!(
            alert_id = %alert_id,
            severity = severity.as_str(),
            source = %alert.source,
            "创建告警"
        );

        lock(&self.inner.state).alerts.push(alert.clone());
        self.inner.events.publish(MonitoringEvent::AlertCreated {
            alert: alert.clone(),
        });
        self.notify(&alert);

        if let Some(repository) = self.inner.alert_repository.get() {
            if let Err(e) = repository.create(&alert).await {
                warn!(alert_id = %alert_id, "保存告警失败: {e}");
            }
        }
        alert_id
    }

    /// 确认告警；未知或已确认的告警返回 false
    pub async fn acknowledge_alert(&self, alert_id: AlertId, by: &str) -> bool {
        let now = self.inner.clock.now();
        let acknowledged = {
            let mut state = lock(&self.inner.state);
            match state.alerts.iter_mut().find(|alert| alert.id == alert_id) {
                Some(alert) => alert.acknowledge(by, now).then(|| alert.clone()),
                None => None,
            }
        };
        let Some(alert) = acknowledged else {
            return false;
        };

        info!(alert_id = %alert_id, by, "告警已确认");
        self.inner.events.publish(MonitoringEvent::AlertAcknowledged {
            alert: alert.clone(),
        });
        if let Some(repository) = self.inner.alert_repository.get() {
            if let Err(e) = repository.update(&alert).await {
                warn!(alert_id = %alert_id, "更新告警失败: {e}");
            }
        }
        true
    }

    pub fn get_system_health(&self) -> SystemHealth {
        SystemHealth::rollup(lock(&self.inner.state).health.clone())
    }

    /// 按过滤条件查询告警，最新的在前
    pub fn get_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let state = lock(&self.inner.state);
        state
            .alerts
            .iter()
            .rev()
            .filter(|alert| filter.matches(alert))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn get_alert(&self, alert_id: AlertId) -> Option<Alert> {
        lock(&self.inner.state)
            .alerts
            .iter()
            .find(|alert| alert.id == alert_id)
            .cloned()
    }

    /// 指标历史，按记录顺序排列
    pub fn get_metrics_history(&self, since: Option<DateTime<Utc>>) -> Vec<MetricsSnapshot> {
        lock(&self.inner.state)
            .history
            .iter()
            .filter(|snapshot| since.map_or(true, |since| snapshot.timestamp >= since))
            .cloned()
            .collect()
    }

    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        lock(&self.inner.state).history.back().cloned()
    }

    /// 按保留时长清理告警和指标历史
    pub async fn cleanup(&self) -> SerplineResult<CleanupReport> {
        let now = self.inner.clock.now();
        let alert_cutoff = now - hours(self.inner.config.alert_retention_hours);
        let metrics_cutoff = now - hours(self.inner.config.metrics_retention_hours);

        let report = {
            let mut state = lock(&self.inner.state);
            let alerts_before = state.alerts.len();
            state.alerts.retain(|alert| alert.timestamp >= alert_cutoff);
            let metrics_before = state.history.len();
            state
                .history
                .retain(|snapshot| snapshot.timestamp >= metrics_cutoff);
            CleanupReport {
                alerts_removed: alerts_before - state.alerts.len(),
                metrics_removed: metrics_before - state.history.len(),
            }
        };

        if let Some(repository) = self.inner.alert_repository.get() {
            let removed = repository.delete_before(alert_cutoff).await?;
            debug!(removed, "已清理仓储中的过期告警");
        }
        info!(
            alerts_removed = report.alerts_removed,
            metrics_removed = report.metrics_removed,
            "监控数据清理完成"
        );
        Ok(report)
    }

    /// 按配置的间隔周期清理，收到关闭信号后退出
    pub fn start_cleanup_task(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let service = self.clone();
        let period = Duration::from_secs(self.inner.config.cleanup_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.cleanup().await {
                            error!("监控数据清理失败: {e}");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("监控清理任务收到关闭信号");
                        break;
                    }
                }
            }
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitoringEvent> {
        self.inner.events.subscribe()
    }

    fn notify(&self, alert: &Alert) {
        let channels = lock(&self.inner.channels).clone();
        for channel in channels {
            if let Err(e) = channel.send_alert(alert) {
                error!(channel = channel.name(), "发送告警通知失败: {e}");
            }
        }
    }
}

/// 保留时长上限一百年
fn hours(hours: u64) -> chrono::Duration {
    chrono::Duration::hours(hours.min(24 * 365 * 100) as i64)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
