//! 后台清理任务
//!
//! 周期性删除过期的计数条目和封禁条目，只用于限制内存占用。
//! 判决的正确性不依赖清理任务：存储在访问时会按过期处理。

use crate::clock::Clock;
use crate::error::ShieldError;
use crate::storage::{BlockStore, CounterStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// 单次清理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub counters_removed: usize,
    pub blocks_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.counters_removed + self.blocks_removed
    }
}

#[derive(Clone)]
struct SweepTask {
    counters: Arc<dyn CounterStore>,
    blocks: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
    grace: chrono::Duration,
}

impl SweepTask {
    async fn run(&self) -> Result<SweepReport, ShieldError> {
        let now = self.clock.now();
        let counters_removed = self.counters.sweep_counters(now, self.grace).await?;
        let blocks_removed = self.blocks.sweep_blocks(now).await?;

        let report = SweepReport {
            counters_removed,
            blocks_removed,
        };
        if report.total() > 0 {
            info!(
                "Sweep removed {} counter entries and {} block entries",
                counters_removed, blocks_removed
            );
        } else {
            debug!("Sweep found nothing to remove");
        }
        Ok(report)
    }
}

/// 清理任务
pub struct Sweeper {
    task: SweepTask,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        blocks: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            task: SweepTask {
                counters,
                blocks,
                clock,
                grace: crate::clock::to_delta(grace),
            },
            interval,
            handle: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 立即执行一次清理
    pub async fn sweep_once(&self) -> Result<SweepReport, ShieldError> {
        self.task.run().await
    }

    /// 启动后台任务；已在运行时不做任何事
    ///
    /// 第一次清理发生在一个间隔之后。
    pub fn start(&self) -> Result<(), ShieldError> {
        let mut handle = self.handle.lock();
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            debug!("Sweeper already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ShieldError::ConfigError(format!("清理任务需要 tokio 运行时: {}", e)))?;

        let task = self.task.clone();
        let period = self.interval;
        *handle = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = task.run().await {
                    error!("Sweep failed: {}", e);
                }
            }
        }));

        info!("Sweeper started (interval: {:?})", period);
        Ok(())
    }

    /// 停止后台任务
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Sweeper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
