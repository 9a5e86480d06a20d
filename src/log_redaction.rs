//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 日志脱敏模块
//!
//! 诊断日志中的用户ID和地址只输出掩码形式；审计事件不经过这里。

use crate::constants::UNKNOWN_ADDRESS;
use crate::identifier::Identifier;

/// 基础脱敏：保留首尾各两个字符
#[inline]
pub fn redact_basic(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return UNKNOWN_ADDRESS.to_string();
    }

    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }

    let prefix: String = chars[..2].iter().collect();
    let suffix: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", prefix, suffix)
}

/// 用户ID脱敏
#[inline]
pub fn redact_user_id(value: &str) -> String {
    redact_basic(value)
}

/// IP地址脱敏
///
/// IPv4 保留前两段，IPv6 保留第一组。
pub fn redact_ip(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() || value == UNKNOWN_ADDRESS {
        return UNKNOWN_ADDRESS.to_string();
    }

    match value.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            let octets = v4.octets();
            format!("{}.{}.***.***", octets[0], octets[1])
        }
        Ok(std::net::IpAddr::V6(_)) => {
            let head = value.split(':').next().unwrap_or_default();
            format!("{}:***:***", head)
        }
        Err(_) => redact_basic(value),
    }
}

/// 标识符脱敏，保留类型前缀
pub fn redact_identifier(identifier: &Identifier) -> String {
    match identifier {
        Identifier::User(id) => format!("user:{}", redact_user_id(id)),
        Identifier::Ip(addr) => format!("ip:{}", redact_ip(addr)),
    }
}
