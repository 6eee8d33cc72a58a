use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serpline_annotation::{AnnotationPipeline, CommandAnnotationProvider};
use serpline_collector::CollectionOrchestrator;
use serpline_core::clock::{Clock, SystemClock};
use serpline_core::config::AppConfig;
use serpline_core::events::CycleEvent;
use serpline_core::models::{
    AlertId, AnnotationMetrics, HealthCheckResult, HealthStatus, JobPriority, MetricsSnapshot,
    QueueMetrics, SchedulerMetrics,
};
use serpline_core::traits::{
    AlertRepository, AnnotationProvider, CacheEntryRepository, Collector,
    CycleExecutionRepository, HealthCheckRepository, JobRepository, QuerySource,
};
use serpline_infrastructure::{spawn_event_recorder, JobAuditRecorder, MetricsCollector};
use serpline_monitoring::MonitoringService;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownManager;

/// 宿主提供的外部能力
#[derive(Clone)]
pub struct Capabilities {
    pub collector: Arc<dyn Collector>,
    pub query_source: Arc<dyn QuerySource>,
    /// 为空时使用 `annotation.command` 配置的命令行标注服务
    pub annotation_provider: Option<Arc<dyn AnnotationProvider>>,
}

/// 可选的持久化仓储，未提供的部分只保存在内存中
#[derive(Clone, Default)]
pub struct Repositories {
    pub jobs: Option<Arc<dyn JobRepository>>,
    pub cache_entries: Option<Arc<dyn CacheEntryRepository>>,
    pub cycle_executions: Option<Arc<dyn CycleExecutionRepository>>,
    pub alerts: Option<Arc<dyn AlertRepository>>,
    pub health_checks: Option<Arc<dyn HealthCheckRepository>>,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    pipeline: AnnotationPipeline,
    orchestrator: CollectionOrchestrator,
    monitoring: MonitoringService,
    metrics: Arc<MetricsCollector>,
    job_repository: Option<Arc<dyn JobRepository>>,
    shutdown: ShutdownManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Application {
    pub fn new(
        config: AppConfig,
        capabilities: Capabilities,
        repositories: Repositories,
    ) -> Result<Self> {
        Self::with_clock(
            config,
            capabilities,
            repositories,
            Arc::new(SystemClock::new()),
        )
    }

    pub fn with_clock(
        config: AppConfig,
        capabilities: Capabilities,
        repositories: Repositories,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("应用配置校验失败")?;

        let provider = match capabilities.annotation_provider {
            Some(provider) => provider,
            None => {
                let command = config
                    .annotation
                    .command
                    .clone()
                    .ok_or_else(|| anyhow!("未提供标注服务，也未配置 annotation.command"))?;
                Arc::new(CommandAnnotationProvider::new(command)) as Arc<dyn AnnotationProvider>
            }
        };
        info!(provider = provider.name(), "初始化应用程序");

        let mut pipeline = AnnotationPipeline::new(
            config.annotation.clone(),
            config.queue.clone(),
            provider,
            clock.clone(),
        );
        if let Some(repository) = repositories.cache_entries {
            pipeline = pipeline.with_repository(repository);
        }

        let mut orchestrator = CollectionOrchestrator::new(
            config.collection.clone(),
            capabilities.collector,
            capabilities.query_source,
            clock.clone(),
        );
        if let Some(repository) = repositories.cycle_executions {
            orchestrator = orchestrator.with_repository(repository);
        }

        let mut monitoring = MonitoringService::new(config.monitoring.clone(), clock.clone());
        if let Some(repository) = repositories.alerts {
            monitoring = monitoring.with_alert_repository(repository);
        }
        if let Some(repository) = repositories.health_checks {
            monitoring = monitoring.with_health_repository(repository);
        }

        Ok(Self {
            config,
            clock,
            pipeline,
            orchestrator,
            monitoring,
            metrics: Arc::new(MetricsCollector::new()),
            job_repository: repositories.jobs,
            shutdown: ShutdownManager::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 预热缓存并启动各组件和后台任务
    pub async fn start(&self) -> Result<()> {
        let warmed = self
            .pipeline
            .warm_cache()
            .await
            .context("预热标注缓存失败")?;

        // 先订阅再启动，避免漏掉早期事件
        let mut tasks = Vec::new();
        let metrics = self.metrics.clone();
        tasks.push(spawn_event_recorder(
            self.pipeline.subscribe_queue(),
            move |event| metrics.record_queue_event(event),
        ));
        let metrics = self.metrics.clone();
        tasks.push(spawn_event_recorder(
            self.pipeline.subscribe(),
            move |event| metrics.record_annotation_event(event),
        ));
        let metrics = self.metrics.clone();
        tasks.push(spawn_event_recorder(
            self.orchestrator.subscribe(),
            move |event| metrics.record_cycle_event(event),
        ));
        if let Some(repository) = &self.job_repository {
            let recorder = JobAuditRecorder::new(repository.clone());
            tasks.push(recorder.spawn(self.pipeline.subscribe_queue()));
        }

        self.pipeline.start();

        tasks.push(self.spawn_forwarder(
            self.orchestrator.subscribe(),
            self.shutdown.subscribe().await,
        ));
        tasks.push(self.spawn_sampler(self.shutdown.subscribe().await));
        tasks.push(
            self.monitoring
                .start_cleanup_task(self.shutdown.subscribe().await),
        );
        lock(&self.tasks).extend(tasks);

        info!(warmed, "应用程序已启动");
        Ok(())
    }

    /// 采样一次组件指标，记录到监控服务并更新派生的健康状态
    pub async fn sample_metrics(&self) -> Vec<AlertId> {
        self.sampler().sample().await
    }

    /// 按顺序关闭：通知后台任务、取消运行中的采集、停止标注流水线
    pub async fn shutdown(&self) {
        if self.shutdown.is_shutdown().await {
            debug!("应用程序已经关闭");
            return;
        }
        info!("开始关闭应用程序");
        self.shutdown.shutdown().await;

        for execution_id in self.orchestrator.running_executions() {
            if self.orchestrator.cancel_collection_cycle(execution_id).await {
                info!(execution_id = %execution_id, "已取消运行中的采集");
            }
        }
        self.pipeline.stop().await;

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            // 事件记录任务只在发布方释放后退出，这里直接终止
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("后台任务异常退出: {e}");
                }
            }
        }
        info!("应用程序已关闭");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &AnnotationPipeline {
        &self.pipeline
    }

    pub fn orchestrator(&self) -> &CollectionOrchestrator {
        &self.orchestrator
    }

    pub fn monitoring(&self) -> &MonitoringService {
        &self.monitoring
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// 把采集到的搜索结果转交给标注流水线，优先级取自采集周期配置
    fn spawn_forwarder(
        &self,
        mut events: mpsc::UnboundedReceiver<CycleEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let CycleEvent::QueryCollected { execution, query, results, .. } = event else {
                            continue;
                        };
                        if results.is_empty() {
                            continue;
                        }
                        let priority = orchestrator
                            .get_cycle(&execution.cycle_config_id)
                            .map(|cycle| cycle.priority)
                            .unwrap_or(JobPriority::Normal);
                        let items = results
                            .iter()
                            .map(|result| result.to_annotation_item(&query))
                            .collect();
                        if let Err(e) = pipeline.enqueue(items, priority) {
                            warn!(
                                execution_id = %execution.id,
                                query_id = %query.id,
                                "采集结果提交标注失败: {e}"
                            );
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("采集结果转发任务收到关闭信号");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_sampler(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let sampler = self.sampler();
        let period = Duration::from_secs(self.config.monitoring.sample_interval_seconds);
        let job_retention = Duration::from_secs(
            self.config
                .monitoring
                .metrics_retention_hours
                .saturating_mul(3600),
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let created = sampler.sample().await;
                        if !created.is_empty() {
                            debug!(alerts = created.len(), "指标采样产生告警");
                        }
                        let (expired, purged) = sampler.pipeline.purge(job_retention);
                        if expired + purged > 0 {
                            debug!(expired, purged, "已清理过期缓存和已结束任务");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("指标采样任务收到关闭信号");
                        break;
                    }
                }
            }
        })
    }

    fn sampler(&self) -> Sampler {
        Sampler {
            config: self.config.clone(),
            clock: self.clock.clone(),
            pipeline: self.pipeline.clone(),
            orchestrator: self.orchestrator.clone(),
            monitoring: self.monitoring.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// 指标采样所需的组件句柄
struct Sampler {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    pipeline: AnnotationPipeline,
    orchestrator: CollectionOrchestrator,
    monitoring: MonitoringService,
    metrics: Arc<MetricsCollector>,
}

impl Sampler {
    async fn sample(&self) -> Vec<AlertId> {
        let snapshot = self.snapshot();
        self.metrics.update_queue_depth(
            snapshot.queue.pending as usize,
            snapshot.queue.running as usize,
        );
        self.metrics.update_collection(&snapshot.collection);

        let now = snapshot.timestamp;
        let queue_health = self.queue_health(&snapshot, now);
        let annotation_health = self.annotation_health(&snapshot, now);

        let mut created = self.monitoring.record_metrics(snapshot).await;
        for result in [queue_health, annotation_health] {
            if let Some(alert_id) = self.monitoring.update_health_check(result).await {
                created.push(alert_id);
            }
        }
        created
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let queue = self.pipeline.queue_stats();
        let pipeline = self.pipeline.stats();
        MetricsSnapshot {
            timestamp: self.clock.now(),
            scheduler: SchedulerMetrics {
                succeeded: queue.succeeded,
                failed: queue.failed,
                cancelled: queue.cancelled,
                retried: queue.retried,
            },
            queue: QueueMetrics {
                pending: queue.pending as u64,
                running: queue.running as u64,
            },
            collection: self.orchestrator.collection_stats(),
            annotation: AnnotationMetrics {
                processed: pipeline.processed,
                failed: pipeline.failed,
                cache_hits: pipeline.cache_hits,
                cache_misses: pipeline.cache_misses,
            },
        }
    }

    fn queue_health(&self, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> HealthCheckResult {
        let threshold = self.config.monitoring.thresholds.queue_pending;
        let (status, message) = match self.pipeline.queue_halted_reason() {
            Some(reason) => (HealthStatus::Unhealthy, format!("任务队列已暂停: {reason}")),
            None if snapshot.queue.pending > threshold => (
                HealthStatus::Degraded,
                format!("待处理任务 {} 超过 {threshold}", snapshot.queue.pending),
            ),
            None => (
                HealthStatus::Healthy,
                format!(
                    "待处理 {}，运行中 {}",
                    snapshot.queue.pending, snapshot.queue.running
                ),
            ),
        };
        HealthCheckResult::new("task_queue", status, message, now)
    }

    fn annotation_health(&self, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> HealthCheckResult {
        let threshold = self.config.monitoring.thresholds.annotation_error_rate;
        let (status, message) = match snapshot.annotation.error_rate() {
            Some(rate) if rate > threshold => (
                HealthStatus::Degraded,
                format!("标注错误率 {:.1}% 超过 {:.1}%", rate * 100.0, threshold * 100.0),
            ),
            _ => (
                HealthStatus::Healthy,
                format!(
                    "已处理 {}，失败 {}",
                    snapshot.annotation.processed, snapshot.annotation.failed
                ),
            ),
        };
        HealthCheckResult::new("annotation_pipeline", status, message, now)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
