//! 存储抽象层
//!
//! 定义计数存储（CounterStore）与地址封禁列表（BlockStore）接口及内存实现。
//!
//! 内存实现基于 DashMap，单个键的"读取-检查-递增"在同一把分片锁内完成，
//! 因此同一标识符的并发请求不会同时越过阈值。

use crate::config::Policy;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// 计数条目
///
/// `block_expiry` 存在即表示处于（或曾处于）封禁状态，到期后按不存在处理。
#[derive(Debug, Clone, PartialEq)]
pub struct CounterEntry {
    /// 当前窗口内的请求数
    pub count: u64,
    /// 当前窗口开始时间
    pub window_start: DateTime<Utc>,
    /// 创建窗口时的窗口长度（供清理任务判断过期）
    pub window: chrono::Duration,
    /// 最近一次请求时间（仅用于诊断）
    pub last_seen: DateTime<Utc>,
    /// 封禁到期时间
    pub block_expiry: Option<DateTime<Utc>>,
}

impl CounterEntry {
    /// 新窗口
    pub fn fresh(now: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
            last_seen: now,
            block_expiry: None,
        }
    }

    pub fn blocked(&self) -> bool {
        self.block_expiry.is_some()
    }

    /// 封禁仍然有效
    pub fn is_block_live(&self, now: DateTime<Utc>) -> bool {
        self.block_expiry.map_or(false, |expiry| now < expiry)
    }

    /// 窗口已过期（严格大于窗口长度）
    pub fn window_expired(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.window_start > window
    }

    /// 当前窗口的重置时间
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }

    /// 清理任务是否可以删除此条目
    pub fn is_evictable(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match self.block_expiry {
            Some(expiry) => now >= expiry,
            None => now - self.window_start > self.window + grace,
        }
    }

    /// 记录一次请求并给出判决
    ///
    /// 有效封禁优先于窗口过期判断；封禁期间不计数。
    pub fn record(&mut self, policy: &Policy, now: DateTime<Utc>) -> Verdict {
        let window = policy.window_delta();

        match self.block_expiry {
            Some(expiry) if now < expiry => {
                self.last_seen = now;
                return Verdict::denied(self, expiry, true, false);
            }
            Some(_) => *self = CounterEntry::fresh(now, window),
            None if self.window_expired(now, window) => *self = CounterEntry::fresh(now, window),
            None => {}
        }

        self.count = self.count.saturating_add(1);
        self.last_seen = now;

        if self.count > policy.max_requests {
            if let Some(block) = policy.block_delta() {
                let expiry = now + block;
                self.block_expiry = Some(expiry);
                return Verdict::denied(self, expiry, true, true);
            }
            return Verdict::denied(self, self.reset_at(), false, false);
        }

        Verdict {
            allowed: true,
            remaining: policy.max_requests - self.count,
            reset_at: self.reset_at(),
            blocked: false,
            newly_blocked: false,
            count: self.count,
            window_start: self.window_start,
        }
    }
}

/// 计数判决
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    /// 剩余配额（下限为0）
    pub remaining: u64,
    /// 窗口重置时间或封禁到期时间
    pub reset_at: DateTime<Utc>,
    pub blocked: bool,
    /// 本次请求触发了封禁
    pub newly_blocked: bool,
    /// 窗口内计数（诊断用）
    pub count: u64,
    /// 计数所属窗口的开始时间
    pub window_start: DateTime<Utc>,
}

impl Verdict {
    fn denied(
        entry: &CounterEntry,
        reset_at: DateTime<Utc>,
        blocked: bool,
        newly_blocked: bool,
    ) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            blocked,
            newly_blocked,
            count: entry.count,
            window_start: entry.window_start,
        }
    }
}

/// 计数统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterStats {
    pub total_entries: usize,
    pub blocked_entries: usize,
}

/// 计数存储接口
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 原子地记录一次请求并返回判决
    async fn evaluate(
        &self,
        key: &str,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<Verdict, StorageError>;

    /// 撤销一次计数（下限为0）
    ///
    /// 仅当条目仍处于 `window_start` 开始的窗口时生效。
    async fn reverse(&self, key: &str, window_start: DateTime<Utc>) -> Result<bool, StorageError>;

    /// 读取条目
    async fn get_entry(&self, key: &str) -> Result<Option<CounterEntry>, StorageError>;

    /// 删除所有以 `:<identifier>` 结尾的条目
    async fn clear_identifier(&self, identifier: &str) -> Result<usize, StorageError>;

    /// 清理过期条目，返回删除数量
    async fn sweep_counters(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<usize, StorageError>;

    /// 统计
    async fn counter_stats(&self, now: DateTime<Utc>) -> Result<CounterStats, StorageError>;
}

/// 封禁来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSource {
    /// 超限自动升级
    Escalation { category: String },
    /// 手动封禁
    Manual { operator: String },
}

/// 地址封禁条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// 到期时间；`expiry <= now` 的条目视为不存在
    pub expiry: DateTime<Utc>,
    pub blocked_at: DateTime<Utc>,
    pub source: BlockSource,
}

/// 地址封禁列表接口
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// 地址当前被封禁时返回到期时间；遇到过期条目时顺便删除
    async fn blocked_until(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// 检查是否被封禁
    async fn is_blocked(&self, address: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        Ok(self.blocked_until(address, now).await?.is_some())
    }

    /// 封禁地址，到期时间无条件设置为 `now + duration`
    async fn block(
        &self,
        address: &str,
        duration: chrono::Duration,
        now: DateTime<Utc>,
        source: BlockSource,
    ) -> Result<DateTime<Utc>, StorageError>;

    /// 解除封禁，返回条目是否存在
    async fn unblock(&self, address: &str) -> Result<bool, StorageError>;

    /// 清理过期封禁
    async fn sweep_blocks(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;

    /// 有效封禁列表
    async fn active_blocks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, BlockEntry)>, StorageError>;
}

/// 内存存储实现
pub struct MemoryStorage {
    counters: DashMap<String, CounterEntry, ahash::RandomState>,
    blocks: DashMap<String, BlockEntry, ahash::RandomState>,
}

impl MemoryStorage {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self {
            counters: DashMap::with_hasher(ahash::RandomState::new()),
            blocks: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// 计数条目数量（含逻辑过期条目）
    pub fn counter_len(&self) -> usize {
        self.counters.len()
    }

    /// 封禁条目数量（含逻辑过期条目）
    pub fn block_len(&self) -> usize {
        self.blocks.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStorage {
    async fn evaluate(
        &self,
        key: &str,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<Verdict, StorageError> {
        // entry 持有该键所在分片的写锁，直到判决完成
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::fresh(now, policy.window_delta()));
        Ok(entry.record(policy, now))
    }

    async fn reverse(&self, key: &str, window_start: DateTime<Utc>) -> Result<bool, StorageError> {
        match self.counters.get_mut(key) {
            Some(mut entry) if entry.window_start == window_start && entry.count > 0 => {
                entry.count -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_entry(&self, key: &str) -> Result<Option<CounterEntry>, StorageError> {
        Ok(self.counters.get(key).map(|entry| entry.clone()))
    }

    async fn clear_identifier(&self, identifier: &str) -> Result<usize, StorageError> {
        let suffix = format!(":{}", identifier);
        let mut removed = 0;
        self.counters.retain(|key, _| {
            if key.ends_with(&suffix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn sweep_counters(
        &self,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<usize, StorageError> {
        let mut removed = 0;
        self.counters.retain(|_, entry| {
            if entry.is_evictable(now, grace) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn counter_stats(&self, now: DateTime<Utc>) -> Result<CounterStats, StorageError> {
        let mut stats = CounterStats::default();
        for entry in self.counters.iter() {
            stats.total_entries += 1;
            if entry.is_block_live(now) {
                stats.blocked_entries += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl BlockStore for MemoryStorage {
    async fn blocked_until(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let expired = match self.blocks.get(address) {
            Some(entry) if entry.expiry > now => return Ok(Some(entry.expiry)),
            Some(_) => true,
            None => false,
        };

        if expired {
            // 过期了，删除记录（期间可能已被重新封禁，所以再判断一次）
            self.blocks.remove_if(address, |_, entry| entry.expiry <= now);
        }
        Ok(None)
    }

    async fn block(
        &self,
        address: &str,
        duration: chrono::Duration,
        now: DateTime<Utc>,
        source: BlockSource,
    ) -> Result<DateTime<Utc>, StorageError> {
        let expiry = now + duration;
        self.blocks.insert(
            address.to_string(),
            BlockEntry {
                expiry,
                blocked_at: now,
                source,
            },
        );
        Ok(expiry)
    }

    async fn unblock(&self, address: &str) -> Result<bool, StorageError> {
        Ok(self.blocks.remove(address).is_some())
    }

    async fn sweep_blocks(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut removed = 0;
        self.blocks.retain(|_, entry| {
            if entry.expiry <= now {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn active_blocks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, BlockEntry)>, StorageError> {
        let mut blocks: Vec<(String, BlockEntry)> = self
            .blocks
            .iter()
            .filter(|entry| entry.expiry > now)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        blocks.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(blocks)
    }
}
