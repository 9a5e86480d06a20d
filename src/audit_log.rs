//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 审计日志模块
//!
//! 记录封禁命中、超限拒绝以及管理操作。事件通过有界通道交给后台任务批量写出，
//! 发送端使用 `try_send`，请求路径上永远不会等待日志写入。

use crate::config::duration_str;
use crate::constants::*;
use crate::error::ShieldError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError, Sender};
use tracing::{error, info, trace, warn};

/// 审计动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// 被封禁地址的请求
    BlockedRequest,
    /// 超出类别配额
    RateLimitExceeded,
    /// 手动封禁地址
    ManualIpBlock,
    /// 手动解封地址
    ManualIpUnblock,
    /// 清除标识符的计数状态
    ClearRateLimits,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::BlockedRequest => "blocked_request",
            AuditAction::RateLimitExceeded => "rate_limit_exceeded",
            AuditAction::ManualIpBlock => "manual_ip_block",
            AuditAction::ManualIpUnblock => "manual_ip_unblock",
            AuditAction::ClearRateLimits => "clear_rate_limits",
        }
    }

    fn is_admin(&self) -> bool {
        matches!(
            self,
            AuditAction::ManualIpBlock | AuditAction::ManualIpUnblock | AuditAction::ClearRateLimits
        )
    }
}

/// 审计事件
///
/// 审计记录面向运维人员，保留原始的用户ID和地址。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// 未认证请求为 "anonymous"
    pub user_id: String,
    pub action: AuditAction,
    pub resource: String,
    pub details: serde_json::Value,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        user_id: Option<&str>,
        ip_address: &str,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: user_id.unwrap_or(ANONYMOUS_USER).to_string(),
            action,
            resource: AUDIT_RESOURCE.to_string(),
            details,
            ip_address: ip_address.to_string(),
            user_agent: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(str::to_string);
        self
    }
}

/// 审计事件接收端
///
/// 实现不得阻塞调用方；失败由调用方记录后忽略。
pub trait AuditSink: Send + Sync {
    fn log_event(&self, event: AuditEvent) -> Result<(), ShieldError>;
}

/// 丢弃所有事件
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn log_event(&self, event: AuditEvent) -> Result<(), ShieldError> {
        trace!("丢弃审计事件: {}", event.action.as_str());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct AuditLogStats {
    total_events: AtomicU64,
    blocked_request_events: AtomicU64,
    rate_limit_events: AtomicU64,
    admin_events: AtomicU64,
    batch_writes: AtomicU64,
    write_failures: AtomicU64,
    dropped_events: AtomicU64,
}

impl AuditLogStats {
    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn blocked_request_events(&self) -> u64 {
        self.blocked_request_events.load(Ordering::Relaxed)
    }

    pub fn rate_limit_events(&self) -> u64 {
        self.rate_limit_events.load(Ordering::Relaxed)
    }

    pub fn admin_events(&self) -> u64 {
        self.admin_events.load(Ordering::Relaxed)
    }

    pub fn batch_writes(&self) -> u64 {
        self.batch_writes.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// 因通道已满或已关闭而丢弃的事件
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn record(&self, action: AuditAction) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let counter = match action {
            AuditAction::BlockedRequest => &self.blocked_request_events,
            AuditAction::RateLimitExceeded => &self.rate_limit_events,
            _ if action.is_admin() => &self.admin_events,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// 审计日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditLogConfig {
    pub enabled: bool,
    pub channel_capacity: usize,
    pub batch_size: usize,
    #[serde(with = "duration_str")]
    pub batch_timeout: Duration,
    /// JSON Lines 输出文件
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// 日志轮转：最大文件大小（字节）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    /// 日志轮转：保留的文件数量
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: DEFAULT_AUDIT_CHANNEL_CAPACITY,
            batch_size: DEFAULT_AUDIT_BATCH_SIZE,
            batch_timeout: Duration::from_secs(DEFAULT_AUDIT_BATCH_TIMEOUT_SECS),
            output_path: None,
            max_file_size: Some(100 * 1024 * 1024),
            max_files: Some(10),
        }
    }
}

impl AuditLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn rotation(mut self, max_file_size: u64, max_files: usize) -> Self {
        self.max_file_size = Some(max_file_size);
        self.max_files = Some(max_files);
        self
    }

    pub fn validate(&self) -> Result<(), ShieldError> {
        if self.channel_capacity == 0 {
            return Err(ShieldError::ConfigError(
                "审计通道容量必须大于0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ShieldError::ConfigError(
                "审计批量大小必须大于0".to_string(),
            ));
        }
        if self.batch_timeout.is_zero() {
            return Err(ShieldError::ConfigError(
                "审计批量超时必须大于0".to_string(),
            ));
        }
        if self.max_files == Some(0) {
            return Err(ShieldError::ConfigError(
                "审计日志保留文件数必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 基于通道的审计日志记录器
#[derive(Debug)]
pub struct AuditLogger {
    sender: RwLock<Option<Sender<AuditEvent>>>,
    stats: Arc<AuditLogStats>,
    config: AuditLogConfig,
    write_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AuditLogger {
    /// 创建记录器并启动后台写入任务（需要在 tokio 运行时内调用）
    pub async fn new(config: AuditLogConfig) -> Self {
        info!(
            "创建审计日志记录器: enabled={}, output={:?}",
            config.enabled, config.output_path
        );

        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let stats = Arc::new(AuditLogStats::default());

        let write_handle = tokio::spawn(Self::write_task(
            receiver,
            Arc::clone(&stats),
            config.clone(),
        ));

        Self {
            sender: RwLock::new(Some(sender)),
            stats,
            config,
            write_handle: Mutex::new(Some(write_handle)),
        }
    }

    async fn write_task(
        mut receiver: mpsc::Receiver<AuditEvent>,
        stats: Arc<AuditLogStats>,
        config: AuditLogConfig,
    ) {
        let mut batch = Vec::with_capacity(config.batch_size);
        let mut timeout = tokio::time::interval(config.batch_timeout);

        loop {
            tokio::select! {
                result = receiver.recv() => match result {
                    Some(event) => {
                        stats.record(event.action);
                        batch.push(event);
                        if batch.len() >= config.batch_size {
                            Self::write_batch(&batch, &config, &stats);
                            batch.clear();
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            Self::write_batch(&batch, &config, &stats);
                        }
                        break;
                    }
                },
                _ = timeout.tick() => {
                    if !batch.is_empty() {
                        Self::write_batch(&batch, &config, &stats);
                        batch.clear();
                    }
                }
            }
        }

        info!("审计日志写入任务结束");
    }

    fn write_batch(batch: &[AuditEvent], config: &AuditLogConfig, stats: &AuditLogStats) {
        stats.batch_writes.fetch_add(1, Ordering::Relaxed);

        let mut lines = Vec::with_capacity(batch.len());
        for event in batch {
            match serde_json::to_string(event) {
                Ok(json) => {
                    info!(target: "rateshield::audit", "审计日志: {}", json);
                    lines.push(json);
                }
                Err(e) => {
                    stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    error!("序列化审计日志失败: {}", e);
                }
            }
        }

        if let Some(ref path) = config.output_path {
            if let Err(e) = append_lines(path, &lines, config) {
                stats
                    .write_failures
                    .fetch_add(lines.len() as u64, Ordering::Relaxed);
                error!("写入审计日志文件失败: {}: {}", path.display(), e);
            } else {
                trace!("写入审计日志文件: {} ({} 条)", path.display(), lines.len());
            }
        }
    }

    pub fn stats(&self) -> &AuditLogStats {
        &self.stats
    }

    pub fn config(&self) -> &AuditLogConfig {
        &self.config
    }

    /// 关闭通道，等待后台任务写完剩余事件
    pub async fn shutdown(&self) {
        info!("停止审计日志记录器");
        drop(self.sender.write().take());

        let handle = self.write_handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("审计日志写入任务未能在5秒内结束");
            }
        }
    }
}

impl AuditSink for AuditLogger {
    fn log_event(&self, event: AuditEvent) -> Result<(), ShieldError> {
        if !self.config.enabled {
            return Ok(());
        }

        let guard = self.sender.read();
        let sender = guard.as_ref().ok_or_else(|| {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            ShieldError::AuditLogError("审计日志记录器已关闭".to_string())
        })?;

        sender.try_send(event).map_err(|e| {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) => ShieldError::AuditLogError("审计通道已满".to_string()),
                TrySendError::Closed(_) => {
                    ShieldError::AuditLogError("审计通道已关闭".to_string())
                }
            }
        })
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if let Some(handle) = self.write_handle.lock().take() {
            handle.abort();
        }
    }
}

/// 以追加模式写入 JSON Lines，超过大小上限时先轮转
fn append_lines(path: &Path, lines: &[String], config: &AuditLogConfig) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;

    if lines.is_empty() {
        return Ok(());
    }

    if let Some(max_size) = config.max_file_size {
        if std::fs::metadata(path).map_or(false, |m| m.len() >= max_size) {
            rotate(path, config.max_files.unwrap_or(1))?;
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

/// audit.log -> audit.1.log -> audit.2.log ...，超出保留数量的最旧文件被删除
fn rotate(path: &Path, keep: usize) -> std::io::Result<()> {
    let numbered = |n: usize| -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audit".to_string());
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "log".to_string());
        path.with_file_name(format!("{}.{}.{}", stem, n, extension))
    };

    let oldest = numbered(keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..keep).rev() {
        let from = numbered(n);
        if from.exists() {
            std::fs::rename(&from, numbered(n + 1))?;
        }
    }
    std::fs::rename(path, numbered(1))
}
