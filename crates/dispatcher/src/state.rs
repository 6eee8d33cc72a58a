//! 任务队列的内部状态
//!
//! 全部字段由 `TaskQueue` 持有的一把互斥锁保护，这里只有同步逻辑，
//! 方便单独测试调度顺序。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serpline_core::models::{Job, JobId, JobPriority, JobState};

const TIERS: usize = 3;

/// 队列统计，终态计数为累计值，不受清理影响
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

pub(crate) struct Entry<P> {
    pub job: Job<P>,
    pub cancel_flag: Arc<AtomicBool>,
    /// 就绪序号，仅在 Pending 时存在
    pub ready_seq: Option<u64>,
}

/// 一次调度决策
pub(crate) enum Selection {
    Run(JobId),
    /// 没有可执行的任务；`Some` 表示最早的重试到期时间
    Wait(Option<DateTime<Utc>>),
}

pub(crate) struct QueueState<P> {
    pub jobs: HashMap<JobId, Entry<P>>,
    ready: [BTreeMap<u64, JobId>; TIERS],
    running_by_tier: [usize; TIERS],
    next_seq: u64,
    pub running: usize,
    pub stopping: bool,
    pub halted: Option<String>,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

impl<P> QueueState<P> {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            ready: Default::default(),
            running_by_tier: [0; TIERS],
            next_seq: 0,
            running: 0,
            stopping: false,
            halted: None,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            retried: 0,
        }
    }

    pub fn insert(&mut self, job: Job<P>) {
        let id = job.id;
        let tier = tier_of(job.priority);
        let seq = self.take_seq();
        self.ready[tier].insert(seq, id);
        self.jobs.insert(
            id,
            Entry {
                job,
                cancel_flag: Arc::new(AtomicBool::new(false)),
                ready_seq: Some(seq),
            },
        );
    }

    pub fn pending_count(&self) -> usize {
        self.ready.iter().map(BTreeMap::len).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.pending_count() == 0
    }

    /// 严格优先级：高优先级层有可执行或正在执行的任务时，低优先级层不会被调度
    pub fn select(&mut self, now: DateTime<Utc>) -> Selection {
        let mut wake_at: Option<DateTime<Utc>> = None;

        for tier in 0..TIERS {
            let mut chosen = None;
            for (&seq, id) in &self.ready[tier] {
                let Some(entry) = self.jobs.get(id) else {
                    continue;
                };
                if entry.job.next_eligible_at <= now {
                    chosen = Some((seq, *id));
                    break;
                }
                wake_at = Some(match wake_at {
                    Some(current) => current.min(entry.job.next_eligible_at),
                    None => entry.job.next_eligible_at,
                });
            }

            if let Some((seq, id)) = chosen {
                self.ready[tier].remove(&seq);
                if let Some(entry) = self.jobs.get_mut(&id) {
                    entry.ready_seq = None;
                    entry.job.transition(JobState::Running, now);
                }
                self.running += 1;
                self.running_by_tier[tier] += 1;
                return Selection::Run(id);
            }

            if self.running_by_tier[tier] > 0 {
                break;
            }
        }

        Selection::Wait(wake_at)
    }

    /// 执行结束，释放 worker 占用
    pub fn release(&mut self, id: JobId) {
        if let Some(entry) = self.jobs.get(&id) {
            let tier = tier_of(entry.job.priority);
            self.running_by_tier[tier] = self.running_by_tier[tier].saturating_sub(1);
            self.running = self.running.saturating_sub(1);
        }
    }

    /// 任务重新进入就绪队列，获得新的序号
    pub fn requeue(&mut self, id: JobId) {
        let seq = self.take_seq();
        if let Some(entry) = self.jobs.get_mut(&id) {
            let tier = tier_of(entry.job.priority);
            entry.ready_seq = Some(seq);
            self.ready[tier].insert(seq, id);
        }
    }

    /// 从就绪队列中移除 Pending 任务
    pub fn unready(&mut self, id: JobId) {
        if let Some(entry) = self.jobs.get_mut(&id) {
            if let Some(seq) = entry.ready_seq.take() {
                let tier = tier_of(entry.job.priority);
                self.ready[tier].remove(&seq);
            }
        }
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.ready
            .iter()
            .flat_map(|tier| tier.values().copied())
            .collect()
    }

    pub fn mark_cancel_requested(&mut self, id: JobId) {
        if let Some(entry) = self.jobs.get_mut(&id) {
            entry.job.cancel_requested = true;
            entry.cancel_flag.store(true, Ordering::Release);
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending_count(),
            running: self.running,
            succeeded: self.succeeded,
            failed: self.failed,
            cancelled: self.cancelled,
            retried: self.retried,
        }
    }

    /// 删除完成时间早于 `before` 的终态任务
    pub fn purge_terminal(&mut self, before: DateTime<Utc>) -> usize {
        let len = self.jobs.len();
        self.jobs.retain(|_, entry| {
            !(entry.job.is_terminal()
                && entry
                    .job
                    .completed_at
                    .map(|completed| completed < before)
                    .unwrap_or(false))
        });
        len - self.jobs.len()
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn tier_of(priority: JobPriority) -> usize {
    priority.rank() as usize
}
