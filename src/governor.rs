//! Governor 主控制器
//!
//! 面向请求的入口：解析标识符，检查地址封禁列表，调用计数器判决，
//! 必要时升级为地址封禁，并在拒绝时发出审计事件。
//!
//! 对于只统计失败请求的类别，准入结果携带一个 [`FinalizeGuard`]，
//! 传输层在得到最终状态码后调用 `finalize`；请求被中途放弃时由 `Drop` 补做撤销。

use crate::audit_log::{AuditAction, AuditEvent, AuditSink};
use crate::ban_manager::{validate_user_id, BanManager};
use crate::clock::{Clock, SystemClock};
use crate::config::{Policy, PolicyRegistry, ShieldConfig};
use crate::constants::*;
use crate::error::{denial_message, Decision, RejectReason, Rejection, ShieldError};
use crate::identifier::{Identifier, RequestContext};
use crate::log_redaction::{redact_identifier, redact_ip};
use crate::storage::{BlockEntry, BlockStore, CounterStore, MemoryStorage, Verdict};
use crate::sweeper::{SweepReport, Sweeper};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 成功状态码范围（1xx-3xx）
pub fn is_success_status(status: u16) -> bool {
    (100..400).contains(&status)
}

/// 配额响应头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitHeaders {
    fn from_verdict(policy: &Policy, verdict: &Verdict) -> Self {
        Self {
            limit: policy.max_requests,
            remaining: verdict.remaining,
            reset_at: verdict.reset_at,
        }
    }

    /// `X-RateLimit-Reset` 使用毫秒精度的 RFC 3339（`Z` 后缀）
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (
                HEADER_RESET,
                self.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ]
    }
}

/// 条件计数的撤销凭证
///
/// 只有第一次 `finalize`（或 drop）生效。
pub struct FinalizeGuard {
    counters: Arc<dyn CounterStore>,
    key: String,
    window_start: DateTime<Utc>,
    done: AtomicBool,
}

impl FinalizeGuard {
    fn new(counters: Arc<dyn CounterStore>, key: String, window_start: DateTime<Utc>) -> Self {
        Self {
            counters,
            key,
            window_start,
            done: AtomicBool::new(false),
        }
    }

    /// 根据最终状态码决定是否撤销计数，返回是否发生了撤销
    ///
    /// 窗口已经滚动或条目已被清理时不做任何事。
    pub async fn finalize(&self, status: u16) -> Result<bool, ShieldError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        if !is_success_status(status) {
            debug!("Request failed with status {}, keeping the count", status);
            return Ok(false);
        }

        let reversed = self.counters.reverse(&self.key, self.window_start).await?;
        debug!("Successful request, count reversed: {}", reversed);
        Ok(reversed)
    }

    pub fn is_finalized(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for FinalizeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizeGuard")
            .field("key", &self.key)
            .field("window_start", &self.window_start)
            .field("done", &self.is_finalized())
            .finish()
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        // 请求被中途放弃，按未失败处理
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let counters = Arc::clone(&self.counters);
                let key = std::mem::take(&mut self.key);
                let window_start = self.window_start;
                runtime.spawn(async move {
                    if let Err(e) = counters.reverse(&key, window_start).await {
                        warn!("Deferred count reversal failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No tokio runtime available, skipping deferred count reversal"),
        }
    }
}

/// 准入结果
#[derive(Debug)]
pub struct Admission {
    pub category: String,
    pub identifier: Identifier,
    pub headers: RateLimitHeaders,
    /// 仅在类别只统计失败请求时存在
    pub guard: Option<FinalizeGuard>,
}

impl Admission {
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        self.headers.to_pairs()
    }

    /// 请求完成后调用；没有撤销凭证时直接返回 false
    pub async fn finalize(&self, status: u16) -> Result<bool, ShieldError> {
        match &self.guard {
            Some(guard) => guard.finalize(status).await,
            None => Ok(false),
        }
    }
}

/// 运维统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub total_entries: usize,
    pub blocked_entries: usize,
    pub blocked_ips: usize,
}

/// Governor 主控制器
pub struct Governor {
    config: ShieldConfig,
    registry: PolicyRegistry,
    counters: Arc<dyn CounterStore>,
    ban_manager: BanManager,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    sweeper: Sweeper,
}

impl Governor {
    /// 创建新的 Governor 实例
    ///
    /// 配置在这里校验，未知类别等问题在启动时暴露。
    pub fn new(
        config: ShieldConfig,
        counters: Arc<dyn CounterStore>,
        blocks: Arc<dyn BlockStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ShieldError> {
        config.validate()?;
        let registry = config.registry()?;

        let sweeper = Sweeper::new(
            Arc::clone(&counters),
            Arc::clone(&blocks),
            Arc::clone(&clock),
            config.sweep_interval,
            config.sweep_grace,
        );

        info!(
            "Governor initialized: categories={:?}, trust_forwarded_for={}",
            registry.categories(),
            config.trust_forwarded_for
        );

        Ok(Self {
            config,
            registry,
            counters,
            ban_manager: BanManager::new(blocks),
            audit,
            clock,
            sweeper,
        })
    }

    /// 使用内存存储和系统时钟
    pub fn in_memory(config: ShieldConfig, audit: Arc<dyn AuditSink>) -> Result<Self, ShieldError> {
        let storage = Arc::new(MemoryStorage::new());
        Self::new(
            config,
            storage.clone(),
            storage,
            audit,
            Arc::new(SystemClock),
        )
    }

    pub fn config(&self) -> &ShieldConfig {
        &self.config
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn policy(&self, category: &str) -> Result<Arc<Policy>, ShieldError> {
        self.registry.get(category)
    }

    /// 检查请求
    ///
    /// 未知类别返回错误；其余结果（允许或拒绝）都是正常的 `Decision`。
    #[instrument(skip(self, context), fields(category = %category))]
    pub async fn check(
        &self,
        category: &str,
        context: &RequestContext,
    ) -> Result<Decision, ShieldError> {
        let policy = self.registry.get(category)?;
        let now = self.clock.now();
        let trust = self.config.trust_forwarded_for;
        let address = context.client_address(trust);
        let identifier = context.identifier(trust);

        // 全局封禁优先于所有类别
        if let Some(expiry) = self.ban_manager.blocked_until(&address, now).await? {
            warn!(
                "请求来自被封禁地址: address={}, category={}",
                redact_ip(&address),
                category
            );
            self.emit(
                AuditEvent::new(
                    AuditAction::BlockedRequest,
                    authenticated_user(context),
                    &address,
                    serde_json::json!({
                        "reason": RejectReason::IpBlocked.as_str(),
                        "category": category,
                        "address": address,
                        "path": context.path,
                        "method": context.method,
                        "reset_at": expiry,
                    }),
                )
                .at(now)
                .with_user_agent(context.user_agent.as_deref()),
            );

            let headers = RateLimitHeaders {
                limit: policy.max_requests,
                remaining: 0,
                reset_at: expiry,
            };
            return Ok(Decision::Rejected(rejection(
                RejectReason::IpBlocked,
                category,
                &identifier,
                true,
                headers,
                now,
            )));
        }

        let key = identifier.counter_key(category);
        let verdict = self.counters.evaluate(&key, &policy, now).await?;
        let headers = RateLimitHeaders::from_verdict(&policy, &verdict);

        if verdict.newly_blocked && policy.escalate_to_ip_block {
            if let Some(block) = policy.block_delta() {
                self.ban_manager
                    .escalate(&address, block, now, category)
                    .await?;
            }
        }

        if !verdict.allowed {
            warn!(
                "Rate limit exceeded: identifier={}, count={}, blocked={}",
                redact_identifier(&identifier),
                verdict.count,
                verdict.blocked
            );
            self.emit(
                AuditEvent::new(
                    AuditAction::RateLimitExceeded,
                    authenticated_user(context),
                    &address,
                    serde_json::json!({
                        "category": category,
                        "identifier": identifier.key(),
                        "address": address,
                        "path": context.path,
                        "method": context.method,
                        "blocked": verdict.blocked,
                        "reset_at": verdict.reset_at,
                    }),
                )
                .at(now)
                .with_user_agent(context.user_agent.as_deref()),
            );

            return Ok(Decision::Rejected(rejection(
                RejectReason::RateLimited,
                category,
                &identifier,
                verdict.blocked,
                headers,
                now,
            )));
        }

        debug!(
            "Request allowed: identifier={}, remaining={}",
            redact_identifier(&identifier),
            verdict.remaining
        );

        let guard = policy.count_only_failures.then(|| {
            FinalizeGuard::new(Arc::clone(&self.counters), key, verdict.window_start)
        });

        Ok(Decision::Allowed(Admission {
            category: category.to_string(),
            identifier,
            headers,
            guard,
        }))
    }

    /// 直接对标识符计数（不检查地址封禁，不发审计事件）
    #[instrument(skip(self, identifier), fields(category = %category))]
    pub async fn evaluate(
        &self,
        category: &str,
        identifier: &Identifier,
    ) -> Result<Verdict, ShieldError> {
        let policy = self.registry.get(category)?;
        let key = identifier.counter_key(category);
        Ok(self.counters.evaluate(&key, &policy, self.clock.now()).await?)
    }

    /// 手动封禁地址，返回到期时间
    #[instrument(skip(self, address), fields(address = %redact_ip(address)))]
    pub async fn manually_block_ip(
        &self,
        address: &str,
        duration: Duration,
        operator: &str,
    ) -> Result<DateTime<Utc>, ShieldError> {
        let now = self.clock.now();
        let expiry = self
            .ban_manager
            .block_manually(address, duration, operator, now)
            .await?;

        self.emit(
            AuditEvent::new(
                AuditAction::ManualIpBlock,
                Some(operator),
                address,
                serde_json::json!({
                    "address": address,
                    "duration_secs": duration.as_secs(),
                    "expires_at": expiry,
                }),
            )
            .at(now),
        );
        Ok(expiry)
    }

    /// 手动解封地址
    #[instrument(skip(self, address), fields(address = %redact_ip(address)))]
    pub async fn manually_unblock_ip(
        &self,
        address: &str,
        operator: &str,
    ) -> Result<bool, ShieldError> {
        let removed = self.ban_manager.unblock(address, operator).await?;

        self.emit(
            AuditEvent::new(
                AuditAction::ManualIpUnblock,
                Some(operator),
                address,
                serde_json::json!({
                    "address": address,
                    "removed": removed,
                }),
            )
            .at(self.clock.now()),
        );
        Ok(removed)
    }

    /// 清除某个用户在所有类别上的计数
    pub async fn clear_user_rate_limits(&self, user_id: &str) -> Result<usize, ShieldError> {
        validate_user_id(user_id)?;
        self.clear_identifier_state(&Identifier::User(user_id.to_string()))
            .await
    }

    /// 删除所有以 `:<identifier>` 结尾的计数条目
    #[instrument(skip(self, identifier), fields(identifier = %redact_identifier(identifier)))]
    pub async fn clear_identifier_state(
        &self,
        identifier: &Identifier,
    ) -> Result<usize, ShieldError> {
        let removed = self.counters.clear_identifier(&identifier.key()).await?;
        info!("Cleared {} counter entries", removed);

        let (user_id, address) = match identifier {
            Identifier::User(id) => (Some(id.as_str()), UNKNOWN_ADDRESS),
            Identifier::Ip(addr) => (None, addr.as_str()),
        };
        self.emit(
            AuditEvent::new(
                AuditAction::ClearRateLimits,
                user_id,
                address,
                serde_json::json!({
                    "identifier": identifier.key(),
                    "removed": removed,
                }),
            )
            .at(self.clock.now()),
        );
        Ok(removed)
    }

    /// 运维统计（只计算仍然有效的封禁）
    pub async fn stats(&self) -> Result<RateLimitStats, ShieldError> {
        let now = self.clock.now();
        let counters = self.counters.counter_stats(now).await?;
        let blocked_ips = self.ban_manager.active_blocks(now).await?.len();

        Ok(RateLimitStats {
            total_entries: counters.total_entries,
            blocked_entries: counters.blocked_entries,
            blocked_ips,
        })
    }

    /// 有效的地址封禁
    pub async fn active_blocks(&self) -> Result<Vec<(String, BlockEntry)>, ShieldError> {
        self.ban_manager.active_blocks(self.clock.now()).await
    }

    /// 启动后台清理任务
    pub fn start_sweeper(&self) -> Result<(), ShieldError> {
        self.sweeper.start()
    }

    pub fn stop_sweeper(&self) {
        self.sweeper.stop();
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper.is_running()
    }

    /// 立即执行一次清理
    pub async fn sweep_now(&self) -> Result<SweepReport, ShieldError> {
        self.sweeper.sweep_once().await
    }

    /// 审计失败只记录，不影响判决
    fn emit(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(e) = self.audit.log_event(event) {
            warn!("审计事件发送失败: action={}, error={}", action.as_str(), e);
        }
    }
}

fn authenticated_user(context: &RequestContext) -> Option<&str> {
    context
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

fn rejection(
    reason: RejectReason,
    category: &str,
    identifier: &Identifier,
    blocked: bool,
    headers: RateLimitHeaders,
    now: DateTime<Utc>,
) -> Rejection {
    let reset_at = headers.reset_at;
    Rejection {
        reason,
        category: category.to_string(),
        identifier: identifier.key(),
        blocked,
        reset_at,
        retry_after: retry_after(reset_at, now),
        headers,
        message: denial_message(blocked, reset_at),
    }
}

/// 距离重置的整秒数（向上取整，下限0）
fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    Duration::from_secs(millis.div_ceil(1000))
}
