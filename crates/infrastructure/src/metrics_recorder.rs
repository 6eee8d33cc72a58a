//! 指标记录
//!
//! 通过 `metrics` 门面上报计数器、仪表和直方图，具体导出由宿主安装的 recorder 决定。
//! 未安装 recorder 时所有记录都是空操作。

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use serpline_core::events::{AnnotationEvent, ComponentEvent, CycleEvent, QueueEvent};
use serpline_core::models::{CollectionMetrics, JobRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct MetricsCollector {
    // 任务队列
    jobs_submitted_total: Counter,
    jobs_succeeded_total: Counter,
    jobs_failed_total: Counter,
    jobs_retried_total: Counter,
    jobs_cancelled_total: Counter,
    job_duration: Histogram,
    queue_pending: Gauge,
    queue_running: Gauge,

    // 标注流水线
    annotation_cache_hits_total: Counter,
    annotations_processed_total: Counter,
    annotations_failed_total: Counter,

    // 采集周期
    cycles_started_total: Counter,
    cycle_pairs_collected_total: Counter,
    cycle_pairs_failed_total: Counter,
    cycle_results_total: Counter,
    collection_success_rate: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_submitted_total: counter!("serpline_jobs_submitted_total"),
            jobs_succeeded_total: counter!("serpline_jobs_succeeded_total"),
            jobs_failed_total: counter!("serpline_jobs_failed_total"),
            jobs_retried_total: counter!("serpline_jobs_retried_total"),
            jobs_cancelled_total: counter!("serpline_jobs_cancelled_total"),
            job_duration: histogram!("serpline_job_duration_seconds"),
            queue_pending: gauge!("serpline_queue_pending"),
            queue_running: gauge!("serpline_queue_running"),
            annotation_cache_hits_total: counter!("serpline_annotation_cache_hits_total"),
            annotations_processed_total: counter!("serpline_annotations_processed_total"),
            annotations_failed_total: counter!("serpline_annotations_failed_total"),
            cycles_started_total: counter!("serpline_cycles_started_total"),
            cycle_pairs_collected_total: counter!("serpline_cycle_pairs_collected_total"),
            cycle_pairs_failed_total: counter!("serpline_cycle_pairs_failed_total"),
            cycle_results_total: counter!("serpline_cycle_results_total"),
            collection_success_rate: gauge!("serpline_collection_success_rate"),
        }
    }

    pub fn record_queue_event<O>(&self, event: &QueueEvent<O>) {
        match event {
            QueueEvent::Submitted { .. } => self.jobs_submitted_total.increment(1),
            QueueEvent::Started { .. } => {}
            QueueEvent::Succeeded { job, .. } => {
                self.jobs_succeeded_total.increment(1);
                if let Some(seconds) = job_duration_seconds(job) {
                    self.job_duration.record(seconds);
                }
            }
            QueueEvent::Retrying { job, error, .. } => {
                self.jobs_retried_total.increment(1);
                debug!(job_id = %job.id, attempt = job.attempt, "任务重试: {error}");
            }
            QueueEvent::Failed { job, error } => {
                self.jobs_failed_total.increment(1);
                counter!("serpline_job_errors_total", "kind" => error.kind()).increment(1);
                warn!(job_id = %job.id, attempt = job.attempt, "任务失败: {error}");
            }
            QueueEvent::Cancelled { .. } => self.jobs_cancelled_total.increment(1),
            QueueEvent::Halted { reason } => {
                counter!("serpline_queue_halts_total").increment(1);
                warn!(reason = %reason, "任务队列已暂停");
            }
        }
    }

    pub fn record_annotation_event(&self, event: &AnnotationEvent) {
        match event {
            AnnotationEvent::Cached { .. } => self.annotation_cache_hits_total.increment(1),
            AnnotationEvent::Processed { .. } => self.annotations_processed_total.increment(1),
            AnnotationEvent::Failed { error, .. } if error.counts_as_failure() => {
                self.annotations_failed_total.increment(1)
            }
            AnnotationEvent::Failed { .. } | AnnotationEvent::Cancelled { .. } => {}
        }
    }

    pub fn record_cycle_event(&self, event: &CycleEvent) {
        match event {
            CycleEvent::Started { .. } => self.cycles_started_total.increment(1),
            CycleEvent::QueryCollected { results, .. } => {
                self.cycle_pairs_collected_total.increment(1);
                self.cycle_results_total.increment(results.len() as u64);
            }
            CycleEvent::QueryFailed { engine, .. } => {
                self.cycle_pairs_failed_total.increment(1);
                counter!("serpline_engine_failures_total", "engine" => engine.clone())
                    .increment(1);
            }
            CycleEvent::Completed { .. }
            | CycleEvent::Failed { .. }
            | CycleEvent::Cancelled { .. } => {
                counter!("serpline_cycles_finished_total", "outcome" => event.event_type())
                    .increment(1);
            }
        }
    }

    pub fn update_queue_depth(&self, pending: usize, running: usize) {
        self.queue_pending.set(pending as f64);
        self.queue_running.set(running as f64);
    }

    pub fn update_collection(&self, metrics: &CollectionMetrics) {
        if let Some(rate) = metrics.success_rate() {
            self.collection_success_rate.set(rate);
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn job_duration_seconds(job: &JobRecord) -> Option<f64> {
    let started = job.started_at?;
    let completed = job.completed_at?;
    let millis = (completed - started).num_milliseconds();
    (millis >= 0).then(|| millis as f64 / 1000.0)
}

/// 消费事件通道直到发布方关闭
pub fn spawn_event_recorder<E, F>(mut events: mpsc::UnboundedReceiver<E>, record: F) -> JoinHandle<()>
where
    E: Send + 'static,
    F: Fn(&E) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            record(&event);
        }
        debug!("事件通道已关闭，指标记录任务退出");
    })
}
