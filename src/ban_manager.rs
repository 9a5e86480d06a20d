//! 封禁管理器
//!
//! 在地址封禁列表之上提供升级封禁、手动封禁/解封以及输入校验。
//!
//! # 功能
//!
//! - 超限升级：账户级封禁同时封禁来源地址
//! - 手动封禁/解封（带操作人）
//! - 地址与封禁时长校验

use crate::clock::to_delta;
use crate::constants::{
    MAX_IP_ADDRESS_LENGTH, MAX_MANUAL_BLOCK_SECS, MAX_USER_ID_LENGTH, UNKNOWN_ADDRESS,
};
use crate::error::ShieldError;
use crate::log_redaction::redact_ip;
use crate::storage::{BlockEntry, BlockSource, BlockStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, instrument, warn};

/// 验证IP地址格式
pub fn validate_ip_address(ip: &str) -> Result<(), ShieldError> {
    if ip.is_empty() {
        return Err(ShieldError::ValidationError("IP地址不能为空".to_string()));
    }

    if ip.len() > MAX_IP_ADDRESS_LENGTH {
        return Err(ShieldError::ValidationError("IP地址过长".to_string()));
    }

    if ip.parse::<std::net::IpAddr>().is_err() {
        return Err(ShieldError::ValidationError(format!("无效的IP地址格式: {}", ip)));
    }

    Ok(())
}

/// 验证用户ID
pub fn validate_user_id(user_id: &str) -> Result<(), ShieldError> {
    if user_id.trim().is_empty() {
        return Err(ShieldError::ValidationError("用户ID不能为空".to_string()));
    }
    if user_id.len() > MAX_USER_ID_LENGTH {
        return Err(ShieldError::ValidationError(format!(
            "用户ID过长，最大长度为 {} 字符",
            MAX_USER_ID_LENGTH
        )));
    }
    if user_id.contains(|c: char| c.is_control()) {
        return Err(ShieldError::ValidationError("用户ID包含非法字符".to_string()));
    }
    Ok(())
}

/// 验证手动封禁时长（0 < duration <= 30天）
pub fn validate_block_duration(duration: StdDuration) -> Result<(), ShieldError> {
    if duration.is_zero() {
        return Err(ShieldError::ValidationError("封禁时长必须大于0".to_string()));
    }
    if duration > StdDuration::from_secs(MAX_MANUAL_BLOCK_SECS) {
        return Err(ShieldError::ValidationError(format!(
            "封禁时长不能超过 {} 秒",
            MAX_MANUAL_BLOCK_SECS
        )));
    }
    Ok(())
}

/// 封禁管理器
///
/// 封禁列表与类别无关：被封禁的地址在所有类别上都会被拒绝。
#[derive(Clone)]
pub struct BanManager {
    store: Arc<dyn BlockStore>,
}

impl BanManager {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }

    /// 地址当前的封禁到期时间
    pub async fn blocked_until(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ShieldError> {
        Ok(self.store.blocked_until(address, now).await?)
    }

    /// 超限升级为地址封禁
    ///
    /// 无法确定来源地址时不封禁，否则所有未知地址的请求都会被一起拒绝。
    #[instrument(skip(self, address), fields(address = %redact_ip(address)))]
    pub async fn escalate(
        &self,
        address: &str,
        duration: chrono::Duration,
        now: DateTime<Utc>,
        category: &str,
    ) -> Result<Option<DateTime<Utc>>, ShieldError> {
        if address == UNKNOWN_ADDRESS {
            warn!("无法确定来源地址，跳过地址封禁: category={}", category);
            return Ok(None);
        }

        let source = BlockSource::Escalation {
            category: category.to_string(),
        };
        let expiry = self.store.block(address, duration, now, source).await?;

        info!(
            "Address blocked after repeated violations: category={}, expires_at={}",
            category, expiry
        );
        Ok(Some(expiry))
    }

    /// 手动封禁地址
    #[instrument(skip(self, address), fields(address = %redact_ip(address)))]
    pub async fn block_manually(
        &self,
        address: &str,
        duration: StdDuration,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ShieldError> {
        validate_ip_address(address)?;
        validate_block_duration(duration)?;

        let source = BlockSource::Manual {
            operator: operator.to_string(),
        };
        let expiry = self
            .store
            .block(address, to_delta(duration), now, source)
            .await?;

        info!(
            "Manual block created: operator={}, expires_at={}",
            operator, expiry
        );
        Ok(expiry)
    }

    /// 手动解封地址，返回是否存在封禁记录
    #[instrument(skip(self, address), fields(address = %redact_ip(address)))]
    pub async fn unblock(&self, address: &str, operator: &str) -> Result<bool, ShieldError> {
        validate_ip_address(address)?;

        let removed = self.store.unblock(address).await?;
        if removed {
            info!("Manual unblock: operator={}", operator);
        } else {
            debug!("No block entry found, nothing to unblock");
        }
        Ok(removed)
    }

    /// 有效封禁列表
    pub async fn active_blocks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, BlockEntry)>, ShieldError> {
        Ok(self.store.active_blocks(now).await?)
    }
}
