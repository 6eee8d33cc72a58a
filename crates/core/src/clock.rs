//! 时钟抽象
//!
//! 重试退避、缓存过期和告警保留都依赖当前时间。组件通过构造函数注入
//! `Arc<dyn Clock>`，测试中可以用 [`ManualClock`] 精确控制时间，或者在
//! `#[tokio::test(start_paused = true)]` 下使用 [`SystemClock`]。

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + Debug {
    /// 当前时间
    fn now(&self) -> DateTime<Utc>;
}

/// 以 tokio 时间驱动为基准的系统时钟
///
/// 创建时记录一次墙上时间，之后的读数 = 起点 + tokio 单调时钟流逝量。
/// 暂停 tokio 时间的测试里，这个时钟随 `tokio::time::advance` 和自动推进一起前进。
#[derive(Debug)]
pub struct SystemClock {
    wall_origin: DateTime<Utc>,
    mono_origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            wall_origin: Utc::now(),
            mono_origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.mono_origin.elapsed();
        self.wall_origin + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}

/// 手动推进的时钟，只用于确定性测试
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 两个时间点之间的非负间隔
pub fn duration_until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
