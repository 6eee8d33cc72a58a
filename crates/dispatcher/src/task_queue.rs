use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serpline_core::clock::{duration_until, Clock};
use serpline_core::config::QueueConfig;
use serpline_core::errors::{ExecutionError, SerplineError, SerplineResult};
use serpline_core::events::{EventBus, QueueEvent};
use serpline_core::models::{Job, JobId, JobPriority, JobState};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::handler::{JobContext, JobHandler};
use crate::retry_policy::RetryPolicy;
use crate::state::{QueueState, QueueStats, Selection};

/// 提交任务时的可选参数，未设置的字段取队列配置的默认值
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: JobPriority,
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
    pub correlation_id: Option<String>,
}

impl SubmitOptions {
    pub fn with_priority(priority: JobPriority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

/// 通用的有界并发任务队列
///
/// 固定数量的 worker 按严格优先级、同优先级先进先出的顺序拉取就绪任务，
/// 在超时限制下执行 [`JobHandler`]，并按错误分类决定重试、失败或停机。
/// 队列状态由一把互斥锁保护，`submit`/`cancel`/`status` 都是同步调用。
pub struct TaskQueue<H: JobHandler> {
    inner: Arc<QueueInner<H>>,
}

impl<H: JobHandler> Clone for TaskQueue<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct QueueInner<H: JobHandler> {
    name: String,
    handler: Arc<H>,
    config: QueueConfig,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState<H::Payload>>,
    events: EventBus<QueueEvent<H::Output>>,
    /// 有新任务、任务结束或取消时唤醒 worker
    work_available: Notify,
    /// 队列变为空闲时唤醒 `wait_idle`
    idle: Notify,
    /// 停止时置为 true，中断准入等待
    stop_signal: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Dispatch<P> {
    id: JobId,
    payload: P,
    timeout: Duration,
    ctx: JobContext,
}

impl<H: JobHandler> TaskQueue<H> {
    pub fn new(name: impl Into<String>, handler: H, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let retry_policy = RetryPolicy::from_queue_config(&config);
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                handler: Arc::new(handler),
                config,
                retry_policy,
                clock,
                state: Mutex::new(QueueState::new()),
                events: EventBus::new(),
                work_available: Notify::new(),
                idle: Notify::new(),
                stop_signal: watch::Sender::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }

    /// 启动 worker 池，重复调用无效果
    pub fn start(&self) {
        let mut workers = lock(&self.inner.workers);
        if !workers.is_empty() || self.inner.state().stopping {
            return;
        }
        for worker_index in 0..self.inner.config.concurrency {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker_index).await;
            }));
        }
        info!(
            queue = %self.inner.name,
            concurrency = self.inner.config.concurrency,
            "任务队列已启动"
        );
    }

    /// 提交任务，只加锁不阻塞
    pub fn submit(&self, payload: H::Payload, options: SubmitOptions) -> SerplineResult<JobId> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state();
        if state.stopping {
            return Err(SerplineError::QueueStopped);
        }
        if let Some(reason) = &state.halted {
            return Err(SerplineError::QueueHalted(reason.clone()));
        }

        let max_attempts = options
            .max_attempts
            .unwrap_or_else(|| self.inner.config.default_max_attempts());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.default_timeout());
        let mut job = Job::new(payload, options.priority, max_attempts, timeout, String::new(), now);
        job.correlation_id = options
            .correlation_id
            .unwrap_or_else(|| job.id.to_string());
        let id = job.id;
        let record = job.to_record();

        state.insert(job);
        self.inner.events.publish(QueueEvent::Submitted { job: record });
        drop(state);

        debug!(queue = %self.inner.name, job_id = %id, priority = options.priority.as_str(), "任务已提交");
        self.inner.work_available.notify_waiters();
        Ok(id)
    }

    /// 取消任务
    ///
    /// Pending 任务立即进入 Cancelled；Running 任务只设置取消标记，
    /// 执行结束后结果被丢弃。终态或未知任务返回 false。
    pub fn cancel(&self, id: JobId) -> bool {
        let now = self.inner.clock.now();
        let mut state = self.inner.state();
        let job_state = match state.jobs.get(&id) {
            Some(entry) if !entry.job.is_terminal() && !entry.job.cancel_requested => {
                entry.job.state
            }
            _ => return false,
        };

        match job_state {
            JobState::Pending => {
                state.unready(id);
                state.mark_cancel_requested(id);
                self.inner.finish_cancelled(&mut state, id, now);
            }
            JobState::Running => {
                state.mark_cancel_requested(id);
                info!(queue = %self.inner.name, job_id = %id, "运行中的任务已标记取消，结果将被丢弃");
            }
            _ => return false,
        }
        drop(state);

        self.inner.work_available.notify_waiters();
        self.inner.notify_if_idle();
        true
    }

    pub fn status(&self, id: JobId) -> Option<Job<H::Payload>> {
        self.inner.state().jobs.get(&id).map(|entry| entry.job.clone())
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.state().stats()
    }

    pub fn halted_reason(&self) -> Option<String> {
        self.inner.state().halted.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent<H::Output>> {
        self.inner.events.subscribe()
    }

    /// 等待队列中没有 Pending 和 Running 的任务
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// 停止接收新任务，取消所有 Pending 任务，等待在途任务进入终态
    pub async fn stop(&self) {
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.state();
            if !state.stopping {
                state.stopping = true;
                let pending = state.pending_ids();
                for id in &pending {
                    state.unready(*id);
                    state.mark_cancel_requested(*id);
                    self.inner.finish_cancelled(&mut state, *id, now);
                }
                info!(
                    queue = %self.inner.name,
                    cancelled = pending.len(),
                    running = state.running,
                    "任务队列正在停止"
                );
            }
        }
        self.inner.stop_signal.send_replace(true);
        self.inner.work_available.notify_waiters();

        let workers: Vec<JoinHandle<()>> = lock(&self.inner.workers).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(queue = %self.inner.name, error = %e, "worker 异常退出");
            }
        }
        self.inner.notify_if_idle();
        info!(queue = %self.inner.name, "任务队列已停止");
    }

    /// 清理完成时间早于 `retention` 之前的终态任务
    pub fn purge_finished(&self, retention: Duration) -> usize {
        let before = self.inner.clock.now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::zero());
        self.inner.state().purge_terminal(before)
    }
}

impl<H: JobHandler> QueueInner<H> {
    fn state(&self) -> MutexGuard<'_, QueueState<H::Payload>> {
        lock(&self.state)
    }

    async fn worker_loop(self: Arc<Self>, worker_index: usize) {
        debug!(queue = %self.name, worker = worker_index, "worker 已启动");
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = self.clock.now();
            let next = {
                let mut state = self.state();
                if state.stopping {
                    break;
                }
                match state.select(now) {
                    Selection::Run(id) => state.jobs.get(&id).map(|entry| {
                        let job = &entry.job;
                        let record = job.to_record();
                        let dispatch = Dispatch {
                            id,
                            payload: job.payload.clone(),
                            timeout: job.timeout(),
                            ctx: JobContext::new(
                                id,
                                job.attempt,
                                job.correlation_id.clone(),
                                entry.cancel_flag.clone(),
                            ),
                        };
                        self.events.publish(QueueEvent::Started { job: record });
                        Ok(dispatch)
                    }),
                    Selection::Wait(wake_at) => Some(Err(wake_at)),
                }
            };

            match next {
                Some(Ok(dispatch)) => self.execute(dispatch).await,
                Some(Err(Some(wake_at))) => {
                    let delay = duration_until(now, wake_at);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Some(Err(None)) | None => notified.await,
            }
        }
        debug!(queue = %self.name, worker = worker_index, "worker 已退出");
    }

    async fn execute(&self, dispatch: Dispatch<H::Payload>) {
        let Dispatch {
            id,
            payload,
            timeout,
            ctx,
        } = dispatch;
        debug!(queue = %self.name, job_id = %id, attempt = ctx.attempt, "开始执行任务");

        let mut stopping = self.stop_signal.subscribe();
        let admitted = tokio::select! {
            _ = self.handler.admit(&payload, &ctx) => true,
            _ = stopping.wait_for(|stopping| *stopping) => false,
        };
        if !admitted || ctx.is_cancel_requested() {
            debug!(queue = %self.name, job_id = %id, "任务在准入等待期间被取消");
            self.complete(id, Err(ExecutionError::Cancelled));
            return;
        }

        let handler = self.handler.clone();
        let mut handle = tokio::spawn(async move { handler.handle(payload, ctx).await });
        let result = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExecutionError::transient(format!(
                "任务处理器异常退出: {join_error}"
            ))),
            Err(_) => {
                handle.abort();
                Err(ExecutionError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        self.complete(id, result);
    }

    fn complete(&self, id: JobId, result: Result<H::Output, ExecutionError>) {
        let now = self.clock.now();
        let mut state = self.state();
        state.release(id);

        let cancel_requested = state
            .jobs
            .get(&id)
            .map(|entry| entry.job.cancel_requested)
            .unwrap_or(false);

        if cancel_requested {
            self.finish_cancelled(&mut state, id, now);
        } else {
            match result {
                Ok(output) => self.finish_succeeded(&mut state, id, output, now),
                Err(ExecutionError::Cancelled) => self.finish_cancelled(&mut state, id, now),
                Err(error) => self.finish_failed_attempt(&mut state, id, error, now),
            }
        }
        drop(state);

        self.work_available.notify_waiters();
        self.notify_if_idle();
    }

    fn finish_succeeded(
        &self,
        state: &mut QueueState<H::Payload>,
        id: JobId,
        output: H::Output,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        if !entry.job.transition(JobState::Succeeded, now) {
            return;
        }
        let record = entry.job.to_record();
        state.succeeded += 1;
        debug!(queue = %self.name, job_id = %id, "任务执行成功");
        self.events.publish(QueueEvent::Succeeded {
            job: record,
            output,
        });
    }

    fn finish_cancelled(
        &self,
        state: &mut QueueState<H::Payload>,
        id: JobId,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        if !entry.job.transition(JobState::Cancelled, now) {
            return;
        }
        let record = entry.job.to_record();
        state.cancelled += 1;
        debug!(queue = %self.name, job_id = %id, "任务已取消");
        self.events.publish(QueueEvent::Cancelled { job: record });
    }

    fn finish_failed_attempt(
        &self,
        state: &mut QueueState<H::Payload>,
        id: JobId,
        error: ExecutionError,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let stopping = state.stopping;
        let Some(entry) = state.jobs.get_mut(&id) else {
            return;
        };
        let job = &mut entry.job;
        job.attempt += 1;
        job.last_error = Some(error.clone());

        if error.is_retryable() && job.has_attempts_left() {
            if stopping {
                // 停止期间不再安排重试
                if job.transition(JobState::Cancelled, now) {
                    let record = job.to_record();
                    state.cancelled += 1;
                    self.events.publish(QueueEvent::Cancelled { job: record });
                }
                return;
            }

            let delay = self.retry_policy.delay_for(job.attempt);
            job.next_eligible_at =
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            job.transition(JobState::Pending, now);
            let record = job.to_record();
            let attempt = job.attempt;
            let max_attempts = job.max_attempts;
            state.requeue(id);
            state.retried += 1;

            warn!(
                queue = %self.name,
                job_id = %id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "任务执行失败，等待重试"
            );
            self.events.publish(QueueEvent::Retrying {
                job: record,
                error,
                delay_ms: delay.as_millis() as u64,
            });
            return;
        }

        if !job.transition(JobState::Failed, now) {
            return;
        }
        let record = job.to_record();
        state.failed += 1;
        error!(
            queue = %self.name,
            job_id = %id,
            attempt = record.attempt,
            kind = error.kind(),
            error = %error,
            "任务最终失败"
        );
        self.events.publish(QueueEvent::Failed {
            job: record,
            error: error.clone(),
        });

        if let ExecutionError::Configuration(reason) = error {
            if state.halted.is_none() {
                error!(queue = %self.name, reason = %reason, "配置错误，任务队列停止接收新任务");
                state.halted = Some(reason.clone());
                self.events.publish(QueueEvent::Halted { reason });
            }
        }
    }

    fn notify_if_idle(&self) {
        if self.state().is_idle() {
            self.idle.notify_waiters();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
