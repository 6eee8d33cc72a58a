//! 采集周期编排
//!
//! 一次执行 = 从查询源选出的查询 × 周期配置的引擎。所有组合以有界并发分发，
//! 单个组合在超时和重试之后仍失败只记录错误，不会中断整个执行。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serpline_core::clock::Clock;
use serpline_core::config::CollectionConfig;
use serpline_core::errors::{ExecutionError, SerplineError, SerplineResult};
use serpline_core::events::{CycleEvent, EventBus};
use serpline_core::models::{
    CollectionMetrics, CycleConfig, CycleErrorEntry, CycleExecution, CycleStatus, ExecutionId,
    Query, SearchResult,
};
use serpline_core::traits::{Collector, CycleExecutionRepository, QuerySource};
use serpline_dispatcher::RetryPolicy;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::rotation::QueryRotation;

/// 单个 查询×引擎 组合的结果
enum PairOutcome {
    Collected(Vec<SearchResult>),
    Failed(ExecutionError),
    /// 执行已取消，没有结果
    Abandoned,
}

struct ExecutionSlot {
    execution: CycleExecution,
    cancel: Arc<AtomicBool>,
    status_tx: watch::Sender<CycleStatus>,
}

#[derive(Default)]
struct PairCounters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    results: AtomicU64,
}

struct OrchestratorInner {
    config: CollectionConfig,
    collector: Arc<dyn Collector>,
    query_source: Arc<dyn QuerySource>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    rotation: QueryRotation,
    cycles: Mutex<HashMap<String, CycleConfig>>,
    executions: Mutex<HashMap<ExecutionId, ExecutionSlot>>,
    events: EventBus<CycleEvent>,
    counters: PairCounters,
    repository: OnceLock<Arc<dyn CycleExecutionRepository>>,
}

/// 采集周期编排器
#[derive(Clone)]
pub struct CollectionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl CollectionOrchestrator {
    pub fn new(
        config: CollectionConfig,
        collector: Arc<dyn Collector>,
        query_source: Arc<dyn QuerySource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry_policy = RetryPolicy::from_collection_config(&config);
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                collector,
                query_source,
                clock,
                retry_policy,
                rotation: QueryRotation::new(),
                cycles: Mutex::new(HashMap::new()),
                executions: Mutex::new(HashMap::new()),
                events: EventBus::new(),
                counters: PairCounters::default(),
                repository: OnceLock::new(),
            }),
        }
    }

    pub fn with_repository(self, repository: Arc<dyn CycleExecutionRepository>) -> Self {
        if self.inner.repository.set(repository).is_err() {
            warn!("采集执行仓储已设置，忽略重复设置");
        }
        self
    }

    /// 注册或替换采集周期
    pub fn register_cycle(&self, config: CycleConfig) -> SerplineResult<()> {
        config.validate()?;
        info!(
            cycle_id = %config.id,
            engines = ?config.engines,
            query_count = config.query_count,
            "注册采集周期"
        );
        lock(&self.inner.cycles).insert(config.id.clone(), config);
        Ok(())
    }

    pub fn unregister_cycle(&self, cycle_id: &str) -> bool {
        let removed = lock(&self.inner.cycles).remove(cycle_id).is_some();
        if removed {
            self.inner.rotation.reset(cycle_id);
            info!(cycle_id, "注销采集周期");
        }
        removed
    }

    pub fn get_cycle(&self, cycle_id: &str) -> Option<CycleConfig> {
        lock(&self.inner.cycles).get(cycle_id).cloned()
    }

    pub fn list_cycles(&self) -> Vec<CycleConfig> {
        let mut cycles: Vec<CycleConfig> = lock(&self.inner.cycles).values().cloned().collect();
        cycles.sort_by(|a, b| a.id.cmp(&b.id));
        cycles
    }

    /// 启动一次执行，返回执行ID；组合在后台分发
    #[instrument(skip(self))]
    pub async fn execute_cycle(&self, cycle_id: &str) -> SerplineResult<ExecutionId> {
        let config = self
            .get_cycle(cycle_id)
            .ok_or_else(|| SerplineError::CycleNotFound {
                id: cycle_id.to_string(),
            })?;

        let queries = match self.inner.load_queries(&config).await {
            Ok(queries) => queries,
            Err(e) => {
                let reason = format!("加载查询源 {} 失败: {e}", config.query_source_id);
                return Err(self.inner.fail_before_start(&config, reason, e).await);
            }
        };

        let selected = self.inner.rotation.select(
            &config.id,
            config.rotation_strategy,
            &queries,
            config.query_count,
        );
        if selected.is_empty() {
            let reason = format!("查询源 {} 没有可用的查询", config.query_source_id);
            let error = ExecutionError::configuration(reason.clone());
            return Err(self.inner.fail_before_start(&config, reason, error).await);
        }

        let mut execution = CycleExecution::new(config.id.clone());
        execution.transition(CycleStatus::Running, self.inner.clock.now());
        execution.progress.total_queries = selected.len() * config.engines.len();
        let execution_id = execution.id;
        let cancel = Arc::new(AtomicBool::new(false));
        let (status_tx, _) = watch::channel(execution.status);

        self.inner
            .counters
            .total
            .fetch_add(execution.progress.total_queries as u64, Ordering::Relaxed);
        lock(&self.inner.executions).insert(
            execution_id,
            ExecutionSlot {
                execution: execution.clone(),
                cancel: cancel.clone(),
                status_tx,
            },
        );
        self.inner.persist_created(&execution).await;

        info!(
            cycle_id = %config.id,
            execution_id = %execution_id,
            pairs = execution.progress.total_queries,
            "采集执行开始"
        );
        self.inner.events.publish(CycleEvent::Started { execution });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(execution_id, config, selected, cancel).await;
        });
        Ok(execution_id)
    }

    /// 取消执行：不再分发新的组合，进行中的调用结束后结果被丢弃
    pub async fn cancel_collection_cycle(&self, execution_id: ExecutionId) -> bool {
        let snapshot = {
            let mut executions = lock(&self.inner.executions);
            let Some(slot) = executions.get_mut(&execution_id) else {
                return false;
            };
            if !slot
                .execution
                .transition(CycleStatus::Cancelled, self.inner.clock.now())
            {
                return false;
            }
            slot.cancel.store(true, Ordering::Release);
            slot.status_tx.send_replace(CycleStatus::Cancelled);
            let snapshot = slot.execution.clone();
            self.inner.events.publish(CycleEvent::Cancelled {
                execution: snapshot.clone(),
            });
            snapshot
        };
        info!(execution_id = %execution_id, "采集执行已取消");
        self.inner.persist_updated(&snapshot).await;
        true
    }

    pub fn get_execution(&self, execution_id: ExecutionId) -> Option<CycleExecution> {
        lock(&self.inner.executions)
            .get(&execution_id)
            .map(|slot| slot.execution.clone())
    }

    /// 按开始时间排列的执行记录，可按周期过滤
    pub fn list_executions(&self, cycle_id: Option<&str>) -> Vec<CycleExecution> {
        let mut executions: Vec<CycleExecution> = lock(&self.inner.executions)
            .values()
            .map(|slot| &slot.execution)
            .filter(|execution| cycle_id.map_or(true, |id| execution.cycle_config_id == id))
            .cloned()
            .collect();
        executions.sort_by_key(|execution| execution.started_at);
        executions
    }

    /// 等待执行进入终态
    pub async fn wait_for_execution(
        &self,
        execution_id: ExecutionId,
    ) -> SerplineResult<CycleExecution> {
        let mut status_rx = lock(&self.inner.executions)
            .get(&execution_id)
            .map(|slot| slot.status_tx.subscribe())
            .ok_or_else(|| SerplineError::ExecutionNotFound {
                id: execution_id.to_string(),
            })?;
        status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| SerplineError::Internal(format!("执行 {execution_id} 的状态通道已关闭")))?;
        self.get_execution(execution_id)
            .ok_or_else(|| SerplineError::ExecutionNotFound {
                id: execution_id.to_string(),
            })
    }

    /// 累计的组合统计
    pub fn collection_stats(&self) -> CollectionMetrics {
        let counters = &self.inner.counters;
        CollectionMetrics {
            total_queries: counters.total.load(Ordering::Relaxed),
            completed_queries: counters.completed.load(Ordering::Relaxed),
            failed_queries: counters.failed.load(Ordering::Relaxed),
            total_results: counters.results.load(Ordering::Relaxed),
        }
    }

    pub fn running_executions(&self) -> Vec<ExecutionId> {
        lock(&self.inner.executions)
            .iter()
            .filter(|(_, slot)| !slot.execution.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CycleEvent> {
        self.inner.events.subscribe()
    }
}

impl OrchestratorInner {
    async fn run(
        &self,
        execution_id: ExecutionId,
        config: CycleConfig,
        queries: Vec<Query>,
        cancel: Arc<AtomicBool>,
    ) {
        let max_concurrent = self.config.max_concurrent_collections.max(1);
        let mut in_flight = FuturesUnordered::new();

        'dispatch: for query in &queries {
            for engine in &config.engines {
                if cancel.load(Ordering::Acquire) {
                    debug!(execution_id = %execution_id, "执行已取消，停止分发");
                    break 'dispatch;
                }
                in_flight.push(self.collect_pair(&config, query, engine, &cancel));

                while in_flight.len() >= max_concurrent {
                    if let Some((query, engine, outcome)) = in_flight.next().await {
                        self.record(execution_id, query, engine, outcome);
                    }
                }
            }
        }

        while let Some((query, engine, outcome)) = in_flight.next().await {
            self.record(execution_id, query, engine, outcome);
        }

        self.finish(execution_id).await;
    }

    /// 在超时和重试限制下采集一个组合
    async fn collect_pair<'a>(
        &self,
        config: &CycleConfig,
        query: &'a Query,
        engine: &'a str,
        cancel: &AtomicBool,
    ) -> (&'a Query, &'a str, PairOutcome) {
        let timeout_ms = config.per_engine_timeout_ms;
        let mut attempt = 0;
        loop {
            if cancel.load(Ordering::Acquire) {
                return (query, engine, PairOutcome::Abandoned);
            }

            let result = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.collector.collect(engine, query),
            )
            .await
            .unwrap_or(Err(ExecutionError::Timeout { timeout_ms }));

            let error = match result {
                Ok(results) => return (query, engine, PairOutcome::Collected(results)),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= config.retry_attempts {
                return (query, engine, PairOutcome::Failed(error));
            }

            let delay = self.retry_policy.delay_for(attempt);
            attempt += 1;
            debug!(
                query_id = %query.id,
                engine,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "采集失败，等待重试"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, execution_id: ExecutionId, query: &Query, engine: &str, outcome: PairOutcome) {
        let now = self.clock.now();
        let mut executions = lock(&self.executions);
        let Some(slot) = executions.get_mut(&execution_id) else {
            return;
        };
        if slot.execution.is_terminal() {
            debug!(execution_id = %execution_id, query_id = %query.id, engine, "执行已结束，丢弃组合结果");
            return;
        }

        let execution = &mut slot.execution;
        let event = match outcome {
            PairOutcome::Collected(results) => {
                execution.progress.completed_queries += 1;
                execution.progress.total_results += results.len();
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .results
                    .fetch_add(results.len() as u64, Ordering::Relaxed);
                CycleEvent::QueryCollected {
                    execution: execution.clone(),
                    query: query.clone(),
                    engine: engine.to_string(),
                    results,
                }
            }
            PairOutcome::Failed(error) => {
                warn!(
                    execution_id = %execution_id,
                    query_id = %query.id,
                    engine,
                    error = %error,
                    "组合采集失败"
                );
                execution.progress.failed_queries += 1;
                execution.errors.push(CycleErrorEntry {
                    query: query.text.clone(),
                    engine: engine.to_string(),
                    message: error.to_string(),
                    timestamp: now,
                });
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                CycleEvent::QueryFailed {
                    execution: execution.clone(),
                    query: query.clone(),
                    engine: engine.to_string(),
                    error,
                }
            }
            PairOutcome::Abandoned => return,
        };
        self.events.publish(event);
    }

    /// 所有组合结束后决定终态
    async fn finish(&self, execution_id: ExecutionId) {
        let snapshot = {
            let mut executions = lock(&self.executions);
            let Some(slot) = executions.get_mut(&execution_id) else {
                return;
            };
            if slot.execution.is_terminal() {
                return;
            }

            let progress = slot.execution.progress;
            let failure = match (progress.success_rate(), self.config.min_success_rate) {
                _ if progress.completed_queries == 0 => Some("所有组合均采集失败".to_string()),
                (Some(rate), Some(min)) if rate < min => Some(format!(
                    "采集成功率 {:.1}% 低于要求的 {:.1}%",
                    rate * 100.0,
                    min * 100.0
                )),
                _ => None,
            };

            let now = self.clock.now();
            let event = match failure {
                Some(reason) => {
                    slot.execution.transition(CycleStatus::Failed, now);
                    slot.execution.error = Some(reason.clone());
                    error!(execution_id = %execution_id, reason = %reason, "采集执行失败");
                    CycleEvent::Failed {
                        execution: slot.execution.clone(),
                        error: reason,
                    }
                }
                None => {
                    slot.execution.transition(CycleStatus::Completed, now);
                    info!(
                        execution_id = %execution_id,
                        completed = progress.completed_queries,
                        failed = progress.failed_queries,
                        results = progress.total_results,
                        "采集执行完成"
                    );
                    CycleEvent::Completed {
                        execution: slot.execution.clone(),
                    }
                }
            };
            slot.status_tx.send_replace(slot.execution.status);
            self.events.publish(event);
            slot.execution.clone()
        };
        self.persist_updated(&snapshot).await;
    }

    /// 开始分发之前失败：记录一条失败的执行。配置错误原样返回，其余视为查询源暂时不可用
    async fn fail_before_start(
        &self,
        config: &CycleConfig,
        reason: String,
        cause: ExecutionError,
    ) -> SerplineError {
        let now = self.clock.now();
        let mut execution = CycleExecution::new(config.id.clone());
        execution.transition(CycleStatus::Failed, now);
        execution.error = Some(reason.clone());
        let (status_tx, _) = watch::channel(execution.status);

        lock(&self.executions).insert(
            execution.id,
            ExecutionSlot {
                execution: execution.clone(),
                cancel: Arc::new(AtomicBool::new(true)),
                status_tx,
            },
        );
        self.persist_created(&execution).await;
        error!(cycle_id = %config.id, execution_id = %execution.id, reason = %reason, "采集执行无法开始");
        self.events.publish(CycleEvent::Failed {
            execution,
            error: reason.clone(),
        });

        match cause {
            ExecutionError::Configuration(_) => SerplineError::Configuration(reason),
            other => SerplineError::QuerySourceUnavailable {
                id: config.query_source_id.clone(),
                reason: format!("{reason} ({})", other.kind()),
            },
        }
    }

    /// 加载查询，暂时性错误按周期的重试次数退避重试
    async fn load_queries(&self, config: &CycleConfig) -> Result<Vec<Query>, ExecutionError> {
        let mut attempt = 0;
        loop {
            let error = match self.query_source.load_queries(&config.query_source_id).await {
                Ok(queries) => return Ok(queries),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= config.retry_attempts {
                return Err(error);
            }

            let delay = self.retry_policy.delay_for(attempt);
            attempt += 1;
            warn!(
                cycle_id = %config.id,
                source_id = %config.query_source_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "加载查询源失败，等待重试"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn persist_created(&self, execution: &CycleExecution) {
        if let Some(repository) = self.repository.get() {
            if let Err(e) = repository.create(execution).await {
                warn!(execution_id = %execution.id, "保存采集执行失败: {e}");
            }
        }
    }

    async fn persist_updated(&self, execution: &CycleExecution) {
        if let Some(repository) = self.repository.get() {
            if let Err(e) = repository.update(execution).await {
                warn!(execution_id = %execution.id, "更新采集执行失败: {e}");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
