//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型，以及限流决策结果。

use crate::governor::RateLimitHeaders;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// RateShield 错误类型
#[derive(Error, Debug)]
pub enum ShieldError {
    /// 请求过多（可通过等待恢复）
    #[error("{message}")]
    TooManyRequests {
        message: String,
        reset_at: DateTime<Utc>,
        blocked: bool,
    },

    /// 未注册的限流类别（调用方配置错误，不可重试）
    #[error("未知的限流类别: {0}")]
    UnknownCategory(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 验证错误
    #[error("验证错误: {0}")]
    ValidationError(String),

    /// 审计日志错误
    #[error("审计日志错误: {0}")]
    AuditLogError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl ShieldError {
    /// 是否值得重试
    ///
    /// `UnknownCategory` 属于编程错误，永远不重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            ShieldError::TooManyRequests { .. } => true,
            ShieldError::StorageError(StorageError::TimeoutError(_))
            | ShieldError::StorageError(StorageError::ConnectionError(_)) => true,
            _ => false,
        }
    }
}

/// 存储错误
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 来源地址在全局封禁列表中
    IpBlocked,
    /// 超出类别配额
    RateLimited,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::IpBlocked => "ip_blocked",
            RejectReason::RateLimited => "rate_limited",
        }
    }
}

/// 拒绝详情
///
/// `blocked` 为 true 表示临时封禁（账户或IP），否则为普通节流。
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub category: String,
    pub identifier: String,
    pub blocked: bool,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Duration,
    pub headers: RateLimitHeaders,
    pub message: String,
}

impl Rejection {
    /// 转换为 `ShieldError::TooManyRequests`
    pub fn into_error(self) -> ShieldError {
        ShieldError::TooManyRequests {
            message: self.message,
            reset_at: self.reset_at,
            blocked: self.blocked,
        }
    }

    /// 响应头（含 Retry-After）
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = self.headers.to_pairs();
        pairs.push((
            crate::constants::HEADER_RETRY_AFTER,
            self.retry_after.as_secs().to_string(),
        ));
        pairs
    }
}

/// 面向用户的拒绝文案
pub(crate) fn denial_message(blocked: bool, reset_at: DateTime<Utc>) -> String {
    let when = reset_at.format("%Y-%m-%d %H:%M:%S UTC");
    if blocked {
        format!(
            "Access temporarily suspended due to repeated violations. Try again after {}.",
            when
        )
    } else {
        format!("Too many requests. Please try again after {}.", when)
    }
}

/// 决策结果
#[derive(Debug)]
pub enum Decision {
    /// 允许
    Allowed(crate::governor::Admission),
    /// 拒绝
    Rejected(Rejection),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    /// 拒绝时返回错误，允许时返回准入凭证
    pub fn into_result(self) -> Result<crate::governor::Admission, ShieldError> {
        match self {
            Decision::Allowed(admission) => Ok(admission),
            Decision::Rejected(rejection) => Err(rejection.into_error()),
        }
    }
}
