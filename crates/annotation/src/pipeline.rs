//! 标注流水线
//!
//! 在任务队列之上增加指纹缓存、同指纹合并和限流批处理。未命中缓存的新指纹
//! 先进入按优先级攒的批次，批次关闭后作为一个队列任务提交；同一指纹的后续
//! 条目只登记为等待者，任务结束时统一通知。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serpline_core::clock::Clock;
use serpline_core::config::{AnnotationConfig, QueueConfig};
use serpline_core::errors::{ExecutionError, SerplineError, SerplineResult};
use serpline_core::events::{AnnotationEvent, EventBus, QueueEvent};
use serpline_core::models::{
    AnnotationItem, AnnotationOutcome, AnnotationRequest, AnnotationResponse, BatchId,
    Fingerprint, JobId, JobPriority, QueueDisposition, QueuedAnnotation,
};
use serpline_core::traits::{AnnotationProvider, CacheEntryRepository};
use serpline_dispatcher::{JobContext, JobHandler, QueueStats, SubmitOptions, TaskQueue};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batcher::{BatchAccumulator, PendingBatch};
use crate::cache::{AnnotationCache, CacheStats};
use crate::fingerprint::fingerprint;
use crate::rate_limiter::RateLimiter;

type OutcomeReply = oneshot::Sender<Result<AnnotationOutcome, ExecutionError>>;

/// 队列任务处理器：一个任务对应一个批次，限流在准入阶段等待，不占用任务超时
pub struct AnnotationJobHandler {
    provider: Arc<dyn AnnotationProvider>,
    limiter: Arc<RateLimiter>,
    estimated_tokens_per_item: u32,
}

impl AnnotationJobHandler {
    fn estimated_tokens(&self, batch: &[AnnotationRequest]) -> u32 {
        self.estimated_tokens_per_item
            .saturating_mul(batch.len() as u32)
    }
}

#[async_trait]
impl JobHandler for AnnotationJobHandler {
    type Payload = Vec<AnnotationRequest>;
    type Output = Vec<AnnotationResponse>;

    async fn admit(&self, batch: &Vec<AnnotationRequest>, ctx: &JobContext) {
        let tokens = self.estimated_tokens(batch);
        debug!(job_id = %ctx.job_id, size = batch.len(), tokens, "等待标注限流配额");
        self.limiter.acquire(tokens).await;
    }

    async fn handle(
        &self,
        batch: Vec<AnnotationRequest>,
        ctx: JobContext,
    ) -> Result<Vec<AnnotationResponse>, ExecutionError> {
        debug!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            provider = self.provider.name(),
            size = batch.len(),
            "调用标注服务"
        );
        self.provider.annotate(&batch).await
    }
}

/// 流水线统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub processed: u64,
    pub failed: u64,
    /// 合并到已有请求的条目数
    pub deduplicated: u64,
    /// 正在攒批或处理中的指纹数
    pub in_flight: usize,
}

struct Waiter {
    item_id: String,
    reply: Option<OutcomeReply>,
}

struct InFlight {
    batch_id: BatchId,
    waiters: Vec<Waiter>,
}

struct PipelineState {
    inflight: HashMap<Fingerprint, InFlight>,
    batches: BatchAccumulator,
    /// 队列任务对应批次中的指纹
    job_index: HashMap<JobId, Vec<Fingerprint>>,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    deduplicated: AtomicU64,
}

type QueueEvents = mpsc::UnboundedReceiver<QueueEvent<Vec<AnnotationResponse>>>;

struct PipelineInner {
    config: AnnotationConfig,
    clock: Arc<dyn Clock>,
    cache: AnnotationCache,
    queue: TaskQueue<AnnotationJobHandler>,
    state: Mutex<PipelineState>,
    events: EventBus<AnnotationEvent>,
    counters: Counters,
    repository: OnceLock<Arc<dyn CacheEntryRepository>>,
    queue_events: Mutex<Option<QueueEvents>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    /// 有新批次开启时唤醒攒批循环
    batch_opened: Notify,
    shutdown: Notify,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct AnnotationPipeline {
    inner: Arc<PipelineInner>,
}

impl AnnotationPipeline {
    pub fn new(
        config: AnnotationConfig,
        queue_config: QueueConfig,
        provider: Arc<dyn AnnotationProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.requests_per_minute,
            config.tokens_per_minute,
            clock.clone(),
        ));
        let handler = AnnotationJobHandler {
            provider,
            limiter,
            estimated_tokens_per_item: config.estimated_tokens_per_item,
        };

        // 攒批和限流等待都在任务超时之外，超时只约束服务调用本身
        let queue_config = QueueConfig {
            default_timeout_ms: config.request_timeout_ms,
            ..queue_config
        };
        let queue = TaskQueue::new("annotation", handler, queue_config, clock.clone());
        let queue_events = queue.subscribe();
        let cache = AnnotationCache::new(config.cache_max_size, config.cache_ttl_ms, clock.clone());
        let batches = BatchAccumulator::new(
            config.batch_size,
            Duration::from_millis(config.processing_interval_ms),
        );

        Self {
            inner: Arc::new(PipelineInner {
                config,
                clock,
                cache,
                queue,
                state: Mutex::new(PipelineState {
                    inflight: HashMap::new(),
                    batches,
                    job_index: HashMap::new(),
                }),
                events: EventBus::new(),
                counters: Counters::default(),
                repository: OnceLock::new(),
                queue_events: Mutex::new(Some(queue_events)),
                flush_task: Mutex::new(None),
                listener_task: Mutex::new(None),
                batch_opened: Notify::new(),
                shutdown: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// 设置缓存持久化仓储，新结果会写入仓储，`warm_cache` 从仓储加载
    pub fn with_repository(self, repository: Arc<dyn CacheEntryRepository>) -> Self {
        if self.inner.repository.set(repository).is_err() {
            warn!("标注缓存仓储已设置，忽略重复设置");
        }
        self
    }

    pub fn start(&self) {
        if self.inner.stopped.load(Ordering::Acquire) {
            warn!("标注流水线已停止，忽略启动");
            return;
        }
        if let Some(rx) = lock(&self.inner.queue_events).take() {
            let inner = self.inner.clone();
            *lock(&self.inner.listener_task) = Some(tokio::spawn(listen(inner, rx)));
        }
        {
            let mut flush_task = lock(&self.inner.flush_task);
            if flush_task.is_none() {
                *flush_task = Some(tokio::spawn(flush_loop(self.inner.clone())));
            }
        }
        self.inner.queue.start();
        info!(
            batch_size = self.inner.config.batch_size,
            requests_per_minute = self.inner.config.requests_per_minute,
            "标注流水线已启动"
        );
    }

    /// 停止接收新条目，取消尚未执行的批次并通知所有等待者
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.cancel_buffered();
        if let Some(flush_task) = lock(&self.inner.flush_task).take() {
            flush_task.abort();
        }

        self.inner.queue.stop().await;
        self.inner.shutdown.notify_one();

        let listener = lock(&self.inner.listener_task).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                error!("标注事件监听任务异常退出: {e}");
            }
        }
        // 监听任务未启动时，队列取消的任务不会有人结算
        self.inner.cancel_remaining();
        info!("标注流水线已停止");
    }

    /// 提交一批条目，立即返回每个条目的去向
    pub fn enqueue(
        &self,
        items: Vec<AnnotationItem>,
        priority: JobPriority,
    ) -> SerplineResult<Vec<QueuedAnnotation>> {
        let mut state = lock(&self.inner.state);
        items
            .into_iter()
            .map(|item| self.inner.enqueue_one(&mut state, item, priority, None))
            .collect()
    }

    /// 提交单个条目并等待结果
    pub async fn annotate(
        &self,
        item: AnnotationItem,
        priority: JobPriority,
    ) -> Result<AnnotationOutcome, ExecutionError> {
        let (reply, rx) = oneshot::channel();
        let queued = {
            let mut state = lock(&self.inner.state);
            self.inner
                .enqueue_one(&mut state, item, priority, Some(reply))
                .map_err(submit_error)?
        };
        debug!(item_id = %queued.item_id, batch_id = ?queued.batch_id(), "等待单条标注结果");
        rx.await.map_err(|_| ExecutionError::Cancelled)?
    }

    /// 从仓储加载未过期的缓存条目
    pub async fn warm_cache(&self) -> SerplineResult<usize> {
        let Some(repository) = self.inner.repository.get() else {
            return Ok(0);
        };
        let since = self.inner.clock.now()
            - chrono::Duration::milliseconds(self.inner.config.cache_ttl_ms as i64);
        let entries = repository.list_since(since).await?;
        let loaded = self.inner.cache.load(entries);
        info!(loaded, "已从仓储预热标注缓存");
        Ok(loaded)
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.inner.counters;
        PipelineStats {
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: counters.cache_misses.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            deduplicated: counters.deduplicated.load(Ordering::Relaxed),
            in_flight: lock(&self.inner.state).inflight.len(),
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// 队列因配置错误暂停时返回原因
    pub fn queue_halted_reason(&self) -> Option<String> {
        self.inner.queue.halted_reason()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    /// 清除过期缓存条目和已结束的队列任务
    pub fn purge(&self, job_retention: Duration) -> (usize, usize) {
        (
            self.inner.cache.purge_expired(),
            self.inner.queue.purge_finished(job_retention),
        )
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AnnotationEvent> {
        self.inner.events.subscribe()
    }

    /// 订阅底层任务队列的事件
    pub fn subscribe_queue(&self) -> QueueEvents {
        self.inner.queue.subscribe()
    }
}

impl PipelineInner {
    /// 在流水线状态锁内完成“查缓存、查在途、进入批次”，保证同一指纹只请求一次
    fn enqueue_one(
        &self,
        state: &mut PipelineState,
        item: AnnotationItem,
        priority: JobPriority,
        reply: Option<OutcomeReply>,
    ) -> SerplineResult<QueuedAnnotation> {
        let fp = fingerprint(&item);

        if let Some(result) = self.cache.get(&fp) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(item_id = %item.id, fingerprint = fp.short(), "标注缓存命中");
            self.events.publish(AnnotationEvent::Cached {
                item_id: item.id.clone(),
                fingerprint: fp.clone(),
                result: result.clone(),
            });
            if let Some(reply) = reply {
                let _ = reply.send(Ok(AnnotationOutcome {
                    item_id: item.id.clone(),
                    fingerprint: fp.clone(),
                    result,
                    cached: true,
                }));
            }
            return Ok(QueuedAnnotation {
                item_id: item.id,
                fingerprint: fp,
                disposition: QueueDisposition::Cached,
            });
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        if let Some(inflight) = state.inflight.get_mut(&fp) {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!(item_id = %item.id, fingerprint = fp.short(), batch_id = %inflight.batch_id, "合并到在途标注请求");
            inflight.waiters.push(Waiter {
                item_id: item.id.clone(),
                reply,
            });
            return Ok(QueuedAnnotation {
                item_id: item.id,
                fingerprint: fp,
                disposition: QueueDisposition::Joined {
                    batch_id: inflight.batch_id,
                },
            });
        }

        if self.stopped.load(Ordering::Acquire) {
            return Err(SerplineError::QueueStopped);
        }
        if let Some(reason) = self.queue.halted_reason() {
            return Err(SerplineError::QueueHalted(reason));
        }

        let item_id = item.id.clone();
        let admission = state.batches.push(
            priority,
            AnnotationRequest {
                fingerprint: fp.clone(),
                item,
            },
            Instant::now(),
        );
        state.inflight.insert(
            fp.clone(),
            InFlight {
                batch_id: admission.batch_id,
                waiters: vec![Waiter {
                    item_id: item_id.clone(),
                    reply,
                }],
            },
        );
        if admission.opened {
            self.batch_opened.notify_one();
        }
        if let Some(batch) = admission.closed {
            self.submit_batch(state, batch);
        }

        Ok(QueuedAnnotation {
            item_id,
            fingerprint: fp,
            disposition: QueueDisposition::Submitted {
                batch_id: admission.batch_id,
            },
        })
    }

    /// 关闭的批次作为一个队列任务提交，提交失败时直接结算其中的等待者
    fn submit_batch(&self, state: &mut PipelineState, batch: PendingBatch) {
        let batch_id = batch.id;
        let size = batch.len();
        let fingerprints: Vec<Fingerprint> = batch
            .requests
            .iter()
            .map(|request| request.fingerprint.clone())
            .collect();

        let submitted = self.queue.submit(
            batch.requests,
            SubmitOptions {
                priority: batch.priority,
                correlation_id: Some(batch_id.to_string()),
                ..Default::default()
            },
        );
        match submitted {
            Ok(job_id) => {
                debug!(batch_id = %batch_id, job_id = %job_id, size, "标注批次已提交");
                state.job_index.insert(job_id, fingerprints);
            }
            Err(e) => {
                warn!(batch_id = %batch_id, size, "标注批次提交失败: {e}");
                let error = submit_error(e);
                for fp in fingerprints {
                    if let Some(inflight) = state.inflight.remove(&fp) {
                        self.settle_failed(&fp, inflight.waiters, &error, 0);
                    }
                }
            }
        }
    }

    /// 提交已经到期的批次
    fn flush_due(&self) {
        let mut state = lock(&self.state);
        let due = state.batches.take_due(Instant::now());
        for batch in due {
            self.submit_batch(&mut state, batch);
        }
    }

    /// 停止时取消尚未提交的批次
    fn cancel_buffered(&self) {
        let mut state = lock(&self.state);
        let drained = state.batches.drain();
        let mut cancelled = 0;
        for batch in drained {
            for request in batch.requests {
                if let Some(inflight) = state.inflight.remove(&request.fingerprint) {
                    cancelled += inflight.waiters.len();
                    self.settle_failed(
                        &request.fingerprint,
                        inflight.waiters,
                        &ExecutionError::Cancelled,
                        0,
                    );
                }
            }
        }
        if cancelled > 0 {
            info!(cancelled, "已取消尚未提交的标注条目");
        }
    }

    fn cancel_remaining(&self) {
        let mut state = lock(&self.state);
        state.job_index.clear();
        let remaining: Vec<(Fingerprint, InFlight)> = state.inflight.drain().collect();
        for (fp, inflight) in remaining {
            self.settle_failed(&fp, inflight.waiters, &ExecutionError::Cancelled, 0);
        }
    }

    /// 任务成功：移除在途记录并在同一把锁内写入缓存
    async fn on_succeeded(&self, job_id: JobId, attempts: u32, output: Vec<AnnotationResponse>) {
        let mut responses: HashMap<Fingerprint, AnnotationResponse> = output
            .into_iter()
            .map(|response| (response.fingerprint.clone(), response))
            .collect();

        let mut settled = Vec::new();
        {
            let mut state = lock(&self.state);
            let Some(fingerprints) = state.job_index.remove(&job_id) else {
                return;
            };
            for fp in fingerprints {
                let Some(inflight) = state.inflight.remove(&fp) else {
                    continue;
                };
                match responses.remove(&fp) {
                    Some(result) => {
                        let entry = self.cache.put(fp.clone(), result.clone());
                        settled.push((fp, inflight.waiters, result, entry));
                    }
                    None => {
                        let error = ExecutionError::validation(format!(
                            "标注服务未返回指纹 {} 的结果",
                            fp.short()
                        ));
                        self.settle_failed(&fp, inflight.waiters, &error, attempts);
                    }
                }
            }
        }

        for (fp, waiters, result, entry) in settled {
            self.counters
                .processed
                .fetch_add(waiters.len() as u64, Ordering::Relaxed);
            debug!(fingerprint = fp.short(), waiters = waiters.len(), "标注完成");

            for waiter in waiters {
                self.events.publish(AnnotationEvent::Processed {
                    item_id: waiter.item_id.clone(),
                    fingerprint: fp.clone(),
                    result: result.clone(),
                });
                if let Some(reply) = waiter.reply {
                    let _ = reply.send(Ok(AnnotationOutcome {
                        item_id: waiter.item_id,
                        fingerprint: fp.clone(),
                        result: result.clone(),
                        cached: false,
                    }));
                }
            }

            if let Some(repository) = self.repository.get() {
                if let Err(e) = repository.put(&entry).await {
                    warn!(fingerprint = fp.short(), "写入标注缓存仓储失败: {e}");
                }
            }
        }
    }

    /// 任务失败或取消：批次中的所有指纹一起结算
    fn on_failed(&self, job_id: JobId, error: ExecutionError, attempts: u32) {
        let mut state = lock(&self.state);
        let Some(fingerprints) = state.job_index.remove(&job_id) else {
            return;
        };
        for fp in fingerprints {
            if let Some(inflight) = state.inflight.remove(&fp) {
                self.settle_failed(&fp, inflight.waiters, &error, attempts);
            }
        }
    }

    /// 取消不计为失败，只发出取消事件
    fn settle_failed(
        &self,
        fp: &Fingerprint,
        waiters: Vec<Waiter>,
        error: &ExecutionError,
        attempts: u32,
    ) {
        let failure = error.counts_as_failure();
        if failure {
            self.counters
                .failed
                .fetch_add(waiters.len() as u64, Ordering::Relaxed);
            warn!(fingerprint = fp.short(), attempts, error = %error, "标注失败");
        } else {
            debug!(fingerprint = fp.short(), waiters = waiters.len(), "标注已取消");
        }

        for waiter in waiters {
            let event = if failure {
                AnnotationEvent::Failed {
                    item_id: waiter.item_id,
                    fingerprint: fp.clone(),
                    error: error.clone(),
                    attempts,
                }
            } else {
                AnnotationEvent::Cancelled {
                    item_id: waiter.item_id,
                    fingerprint: fp.clone(),
                }
            };
            self.events.publish(event);
            if let Some(reply) = waiter.reply {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }
}

/// 到期批次的提交循环，流水线停止时被终止
async fn flush_loop(inner: Arc<PipelineInner>) {
    loop {
        inner.flush_due();
        let deadline = lock(&inner.state).batches.next_deadline();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = inner.batch_opened.notified() => {}
                }
            }
            None => inner.batch_opened.notified().await,
        }
    }
}

async fn listen(inner: Arc<PipelineInner>, mut rx: QueueEvents) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(QueueEvent::Succeeded { job, output }) => {
                    inner.on_succeeded(job.id, job.attempt + 1, output).await
                }
                Some(QueueEvent::Failed { job, error }) => inner.on_failed(job.id, error, job.attempt),
                Some(QueueEvent::Cancelled { job }) => {
                    inner.on_failed(job.id, ExecutionError::Cancelled, job.attempt)
                }
                Some(QueueEvent::Retrying { job, error, delay_ms }) => {
                    debug!(job_id = %job.id, attempt = job.attempt, delay_ms, error = %error, "标注批次等待重试");
                }
                Some(QueueEvent::Halted { reason }) => {
                    error!(reason = %reason, "标注队列已停机");
                }
                Some(_) => {}
                None => break,
            },
            _ = inner.shutdown.notified() => break,
        }
    }
    debug!("标注事件监听已退出");
}

fn submit_error(error: SerplineError) -> ExecutionError {
    match error {
        SerplineError::QueueStopped => ExecutionError::Cancelled,
        SerplineError::QueueHalted(reason) => ExecutionError::configuration(reason),
        other => ExecutionError::transient(other.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
