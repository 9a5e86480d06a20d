//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 标识符解析
//!
//! 从已完成身份识别的请求信息中推导限流标识符：
//! - 已认证用户：`user:<id>`
//! - 匿名请求：`ip:<address>`，地址优先取 X-Forwarded-For 链的第一个元素

use crate::constants::UNKNOWN_ADDRESS;
use std::fmt;

/// 标识符类型
///
/// 限流计数的主体，认证用户优先于网络地址。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// 用户ID
    User(String),
    /// IP地址
    Ip(String),
}

impl Identifier {
    /// 获取标识符的原始值
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::User(s) => s,
            Identifier::Ip(s) => s,
        }
    }

    /// 获取标识符类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            Identifier::User(_) => "user",
            Identifier::Ip(_) => "ip",
        }
    }

    /// 带类型前缀的键名
    pub fn key(&self) -> String {
        format!("{}:{}", self.type_name(), self.as_str())
    }

    /// 计数存储中的复合键 `category:identifier`
    pub fn counter_key(&self, category: &str) -> String {
        format!("{}:{}", category, self.key())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name(), self.as_str())
    }
}

/// 请求上下文
///
/// 传输层已经解析好的请求信息，身份识别由外部完成。
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// 已认证的用户ID
    pub user_id: Option<String>,
    /// 传输层对端地址
    pub remote_addr: Option<String>,
    /// X-Forwarded-For 原始值
    pub forwarded_for: Option<String>,
    /// 请求路径
    pub path: String,
    /// 请求方法
    pub method: String,
    /// User-Agent
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// 创建新的请求上下文
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_remote_addr(mut self, addr: &str) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    pub fn with_forwarded_for(mut self, value: &str) -> Self {
        self.forwarded_for = Some(value.to_string());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    /// 解析客户端地址
    ///
    /// 对于 X-Forwarded-For 格式的地址链（client, proxy1, proxy2），
    /// 取最左边的非空元素；`trust_forwarded_for` 为 false 时只使用对端地址。
    pub fn client_address(&self, trust_forwarded_for: bool) -> String {
        if trust_forwarded_for {
            if let Some(first) = self.forwarded_for.as_deref().and_then(first_forwarded) {
                return first.to_string();
            }
        }

        self.remote_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .unwrap_or(UNKNOWN_ADDRESS)
            .to_string()
    }

    /// 解析限流标识符
    pub fn identifier(&self, trust_forwarded_for: bool) -> Identifier {
        match self.user_id.as_deref().map(str::trim) {
            Some(user_id) if !user_id.is_empty() => Identifier::User(user_id.to_string()),
            _ => Identifier::Ip(self.client_address(trust_forwarded_for)),
        }
    }
}

fn first_forwarded(chain: &str) -> Option<&str> {
    chain.split(',').map(str::trim).find(|s| !s.is_empty())
}
