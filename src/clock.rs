//! 时钟抽象
//!
//! 限流决策只依赖注入的时钟，生产环境使用系统时钟，测试使用可手动推进的时钟。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration as StdDuration;

/// 时钟接口
pub trait Clock: Send + Sync {
    /// 当前时间
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟
///
/// 时间只在调用 `advance` / `set` 时变化。
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// 从指定时间开始
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 从当前系统时间开始
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// 推进时间
    pub fn advance(&self, by: StdDuration) {
        let mut now = self.now.lock();
        *now = *now + to_delta(by);
    }

    /// 设置时间
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// std Duration 转换为 chrono Duration
///
/// 超出 chrono 表示范围时截断为 100 年；策略时长在配置校验阶段已限制在一年以内。
pub fn to_delta(duration: StdDuration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
