//! 日志订阅器初始化
//!
//! 库本身只通过 `tracing` 宏输出，订阅器由宿主程序安装。
//! 这里提供一个基于 `EnvFilter` 的便捷初始化，供示例程序和简单服务使用。
//!
//! # 示例
//!
//! ```rust,no_run
//! rateshield::telemetry::init_tracing(Some("rateshield=debug")).unwrap();
//! ```

use crate::error::ShieldError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认过滤规则
pub const DEFAULT_FILTER: &str = "info";

/// 安装全局 tracing 订阅器
///
/// 显式传入的过滤规则优先，其次是 `RUST_LOG`，最后是 `info`。
/// 重复调用返回 `ConfigError`。
pub fn init_tracing(filter: Option<&str>) -> Result<(), ShieldError> {
    let env_filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| ShieldError::ConfigError(format!("无效的日志过滤规则: {}", e)))?,
        None => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| ShieldError::ConfigError(format!("日志订阅器初始化失败: {}", e)))
}
