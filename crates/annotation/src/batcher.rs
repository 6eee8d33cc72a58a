//! 标注请求攒批
//!
//! 未命中缓存的新指纹按优先级各自攒批。批次达到 `batch_size` 时立即关闭，
//! 否则从第一条请求进入起经过 `processing_interval` 后关闭。关闭的批次由
//! 流水线作为一个队列任务提交，限流和服务调用都以批次为单位。

use std::collections::HashMap;
use std::time::Duration;

use serpline_core::models::{AnnotationRequest, BatchId, JobPriority};
use tokio::time::Instant;

/// 已关闭或正在攒的批次
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub id: BatchId,
    pub priority: JobPriority,
    pub opened_at: Instant,
    pub requests: Vec<AnnotationRequest>,
}

impl PendingBatch {
    fn open(priority: JobPriority, now: Instant, capacity: usize) -> Self {
        Self {
            id: BatchId::new(),
            priority,
            opened_at: now,
            requests: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// 条目进入批次后的结果
#[derive(Debug)]
pub struct Admission {
    pub batch_id: BatchId,
    /// 当前条目是所在批次的第一条
    pub opened: bool,
    /// 批次因为满了而关闭
    pub closed: Option<PendingBatch>,
}

/// 按优先级分开攒批，调用方负责加锁
#[derive(Debug)]
pub struct BatchAccumulator {
    batch_size: usize,
    processing_interval: Duration,
    open: HashMap<JobPriority, PendingBatch>,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize, processing_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            processing_interval,
            open: HashMap::new(),
        }
    }

    pub fn push(
        &mut self,
        priority: JobPriority,
        request: AnnotationRequest,
        now: Instant,
    ) -> Admission {
        let batch_size = self.batch_size;
        let batch = self
            .open
            .entry(priority)
            .or_insert_with(|| PendingBatch::open(priority, now, batch_size));
        let opened = batch.is_empty();
        let batch_id = batch.id;
        batch.requests.push(request);

        let closed = if batch.len() >= batch_size {
            self.open.remove(&priority)
        } else {
            None
        };
        Admission {
            batch_id,
            opened,
            closed,
        }
    }

    /// 取出已经到期的批次，高优先级在前
    pub fn take_due(&mut self, now: Instant) -> Vec<PendingBatch> {
        let interval = self.processing_interval;
        let due: Vec<JobPriority> = self
            .open
            .iter()
            .filter(|(_, batch)| batch.opened_at + interval <= now)
            .map(|(priority, _)| *priority)
            .collect();
        let mut batches: Vec<PendingBatch> = due
            .into_iter()
            .filter_map(|priority| self.open.remove(&priority))
            .collect();
        batches.sort_by_key(|batch| batch.priority.rank());
        batches
    }

    /// 最早到期的时间点
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .map(|batch| batch.opened_at + self.processing_interval)
            .min()
    }

    /// 取出所有未关闭的批次
    pub fn drain(&mut self) -> Vec<PendingBatch> {
        self.open.drain().map(|(_, batch)| batch).collect()
    }

    /// 尚未提交的请求数
    pub fn buffered(&self) -> usize {
        self.open.values().map(PendingBatch::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serpline_core::models::{AnnotationItem, Fingerprint};

    fn request(id: &str) -> AnnotationRequest {
        AnnotationRequest {
            fingerprint: Fingerprint::new(format!("fp-{id}")),
            item: AnnotationItem::new(id, "t", "s", "u"),
        }
    }

    #[test]
    fn test_full_batch_closes_immediately() {
        let now = Instant::now();
        let mut batches = BatchAccumulator::new(3, Duration::from_millis(200));

        let first = batches.push(JobPriority::Normal, request("a"), now);
        assert!(first.opened);
        assert!(first.closed.is_none());
        let second = batches.push(JobPriority::Normal, request("b"), now);
        assert!(!second.opened);
        assert_eq!(second.batch_id, first.batch_id);

        let third = batches.push(JobPriority::Normal, request("c"), now);
        let closed = third.closed.expect("batch should close when full");
        assert_eq!(closed.id, first.batch_id);
        assert_eq!(closed.len(), 3);
        assert_eq!(batches.buffered(), 0);
        assert!(batches.next_deadline().is_none());

        // 关闭后新条目开启新批次
        let fourth = batches.push(JobPriority::Normal, request("d"), now);
        assert!(fourth.opened);
        assert_ne!(fourth.batch_id, first.batch_id);
    }

    #[test]
    fn test_partial_batch_closes_after_interval() {
        let start = Instant::now();
        let mut batches = BatchAccumulator::new(10, Duration::from_millis(200));
        batches.push(JobPriority::Normal, request("a"), start);
        batches.push(
            JobPriority::Normal,
            request("b"),
            start + Duration::from_millis(150),
        );

        assert_eq!(
            batches.next_deadline(),
            Some(start + Duration::from_millis(200))
        );
        assert!(batches
            .take_due(start + Duration::from_millis(199))
            .is_empty());
        let due = batches.take_due(start + Duration::from_millis(200));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].len(), 2);
        assert_eq!(batches.buffered(), 0);
    }

    #[test]
    fn test_priorities_batch_separately() {
        let now = Instant::now();
        let mut batches = BatchAccumulator::new(10, Duration::from_millis(100));
        let low = batches.push(JobPriority::Low, request("l"), now);
        let high = batches.push(JobPriority::High, request("h"), now);
        batches.push(JobPriority::High, request("h2"), now);
        assert_ne!(low.batch_id, high.batch_id);
        assert_eq!(batches.buffered(), 3);

        let due = batches.take_due(now + Duration::from_millis(100));
        let priorities: Vec<JobPriority> = due.iter().map(|batch| batch.priority).collect();
        assert_eq!(priorities, vec![JobPriority::High, JobPriority::Low]);
        assert_eq!(due[0].len(), 2);
    }

    #[test]
    fn test_drain_returns_open_batches() {
        let now = Instant::now();
        let mut batches = BatchAccumulator::new(10, Duration::from_millis(100));
        batches.push(JobPriority::Normal, request("a"), now);
        batches.push(JobPriority::High, request("b"), now);

        let drained = batches.drain();
        assert_eq!(drained.iter().map(PendingBatch::len).sum::<usize>(), 2);
        assert_eq!(batches.buffered(), 0);
    }
}
