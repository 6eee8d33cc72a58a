use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serpline_core::clock::{duration_until, Clock};
use tracing::debug;

const WINDOW_MS: i64 = 60_000;

/// 限流判定结果
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// 需要等待的时长
    WaitFor(Duration),
}

/// 每分钟请求数和 token 数的滑动窗口限流器
///
/// 超过配额的调用会等待到窗口中最早的记录过期，不会返回错误。
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: u32,
    tokens_per_minute: u32,
    window: Mutex<VecDeque<(DateTime<Utc>, u32)>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1),
            tokens_per_minute: tokens_per_minute.max(1),
            window: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    /// 尝试占用一次请求和 `tokens` 个 token
    ///
    /// 单次请求的 token 数超过每分钟配额时按配额计算，避免永远无法通过。
    pub fn try_acquire(&self, tokens: u32) -> RateDecision {
        let tokens = tokens.min(self.tokens_per_minute);
        let now = self.clock.now();
        let window_start = now - chrono::Duration::milliseconds(WINDOW_MS);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());

        while window.front().is_some_and(|(at, _)| *at <= window_start) {
            window.pop_front();
        }

        let used_tokens: u32 = window.iter().map(|(_, t)| *t).sum();
        let request_ok = (window.len() as u32) < self.requests_per_minute;
        let tokens_ok = used_tokens.saturating_add(tokens) <= self.tokens_per_minute;
        if request_ok && tokens_ok {
            window.push_back((now, tokens));
            return RateDecision::Allowed;
        }

        // 找到释放足够配额所需的最早过期时间
        let mut release_at = None;
        let mut remaining_requests = window.len() as u32;
        let mut remaining_tokens = used_tokens;
        for (at, t) in window.iter() {
            remaining_requests -= 1;
            remaining_tokens -= *t;
            if remaining_requests < self.requests_per_minute
                && remaining_tokens.saturating_add(tokens) <= self.tokens_per_minute
            {
                release_at = Some(*at + chrono::Duration::milliseconds(WINDOW_MS));
                break;
            }
        }

        let wait = release_at
            .map(|at| duration_until(now, at))
            .unwrap_or(Duration::from_millis(WINDOW_MS as u64));
        RateDecision::WaitFor(wait.max(Duration::from_millis(1)))
    }

    /// 等待直到配额可用
    pub async fn acquire(&self, tokens: u32) {
        loop {
            match self.try_acquire(tokens) {
                RateDecision::Allowed => return,
                RateDecision::WaitFor(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, tokens, "触发限流，等待配额");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    pub fn in_window(&self) -> usize {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
