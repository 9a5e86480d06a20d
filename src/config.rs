//! 配置模块
//!
//! 定义限流策略（Policy）、类别注册表（PolicyRegistry）以及整体配置结构。
//!
//! 配置支持 YAML 和 TOML 两种格式，时长使用人类可读字符串（如 "15m"、"24h"）。
//!
//! # 示例
//!
//! ```rust
//! use rateshield::config::ShieldConfig;
//!
//! let yaml = r#"
//! sweep_interval: 1m
//! categories:
//!   search:
//!     window: 1m
//!     max_requests: 30
//! "#;
//! let config = ShieldConfig::from_yaml_str(yaml).unwrap();
//! assert!(config.categories.contains_key("search"));
//! assert!(config.categories.contains_key("auth"));
//! ```

use crate::audit_log::AuditLogConfig;
use crate::clock::to_delta;
use crate::constants::*;
use crate::error::ShieldError;
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 单个类别的限流策略（不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// 计数窗口长度
    #[serde(with = "duration_str")]
    pub window: Duration,
    /// 窗口内允许的最大请求数
    pub max_requests: u64,
    /// 超限后的临时封禁时长；为空时只节流不封禁
    #[serde(
        default,
        with = "duration_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub block_duration: Option<Duration>,
    /// 只统计失败的请求（成功响应会撤销本次计数）
    #[serde(default)]
    pub count_only_failures: bool,
    /// 升级为封禁时同时把来源地址加入全局封禁列表
    #[serde(default)]
    pub escalate_to_ip_block: bool,
}

impl Policy {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
            block_duration: None,
            count_only_failures: false,
            escalate_to_ip_block: false,
        }
    }

    /// 设置升级封禁时长
    pub fn with_block(mut self, block_duration: Duration) -> Self {
        self.block_duration = Some(block_duration);
        self
    }

    /// 只统计失败请求
    pub fn count_only_failures(mut self) -> Self {
        self.count_only_failures = true;
        self
    }

    /// 升级封禁时封禁来源地址
    pub fn escalate_to_ip_block(mut self) -> Self {
        self.escalate_to_ip_block = true;
        self
    }

    pub fn window_delta(&self) -> chrono::Duration {
        to_delta(self.window)
    }

    pub fn block_delta(&self) -> Option<chrono::Duration> {
        self.block_duration.map(to_delta)
    }

    /// 校验策略
    pub fn validate(&self, category: &str) -> Result<(), ShieldError> {
        if category.trim().is_empty() {
            return Err(ShieldError::ConfigError("类别名称不能为空".to_string()));
        }
        if category.contains(':') {
            return Err(ShieldError::ConfigError(format!(
                "类别名称不能包含 ':': {}",
                category
            )));
        }
        if self.window.is_zero() {
            return Err(ShieldError::ConfigError(format!(
                "类别 {} 的窗口长度必须大于0",
                category
            )));
        }
        if self.max_requests == 0 {
            return Err(ShieldError::ConfigError(format!(
                "类别 {} 的最大请求数必须大于0",
                category
            )));
        }
        ensure_within_bound(category, "window", self.window)?;

        match self.block_duration {
            Some(block) if block.is_zero() => {
                return Err(ShieldError::ConfigError(format!(
                    "类别 {} 的封禁时长必须大于0",
                    category
                )));
            }
            Some(block) => ensure_within_bound(category, "block_duration", block)?,
            None if self.escalate_to_ip_block => {
                return Err(ShieldError::ConfigError(format!(
                    "类别 {} 启用了地址封禁但未设置封禁时长",
                    category
                )));
            }
            None => {}
        }

        Ok(())
    }
}

/// 策略时长上限，保证 `now + window` 和 `now + block_duration` 不会溢出
fn ensure_within_bound(category: &str, field: &str, value: Duration) -> Result<(), ShieldError> {
    if value > Duration::from_secs(MAX_POLICY_DURATION_SECS) {
        return Err(ShieldError::ConfigError(format!(
            "类别 {} 的 {} 超出上限 ({} 秒)",
            category, field, MAX_POLICY_DURATION_SECS
        )));
    }
    Ok(())
}

/// 内置类别表
pub fn default_policies() -> HashMap<String, Policy> {
    let minutes = |m: u64| Duration::from_secs(m * MINUTE_SECS);
    let hours = |h: u64| Duration::from_secs(h * HOUR_SECS);

    let mut policies = HashMap::new();
    policies.insert(
        CATEGORY_GENERAL.to_string(),
        Policy::new(minutes(15), 100),
    );
    policies.insert(
        CATEGORY_AUTH.to_string(),
        Policy::new(minutes(15), 5)
            .with_block(minutes(30))
            .count_only_failures()
            .escalate_to_ip_block(),
    );
    policies.insert(
        CATEGORY_PASSWORD_RESET.to_string(),
        Policy::new(minutes(60), 3).with_block(minutes(60)),
    );
    policies.insert(CATEGORY_PHI.to_string(), Policy::new(minutes(15), 200));
    policies.insert(
        CATEGORY_EXPORT.to_string(),
        Policy::new(minutes(60), 5).with_block(hours(24)),
    );
    policies.insert(CATEGORY_DOWNLOAD.to_string(), Policy::new(minutes(15), 50));
    policies.insert(
        CATEGORY_API_KEY_ISSUANCE.to_string(),
        Policy::new(hours(24), 3),
    );
    policies
}

/// 类别注册表
///
/// 只读的 类别名 -> 策略 查询表，构造时完成校验。
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    /// 创建注册表，任何非法策略都会导致构造失败
    pub fn new(policies: HashMap<String, Policy>) -> Result<Self, ShieldError> {
        for (category, policy) in &policies {
            policy.validate(category)?;
        }
        Ok(Self {
            policies: policies
                .into_iter()
                .map(|(category, policy)| (category, Arc::new(policy)))
                .collect(),
        })
    }

    /// 使用内置类别表
    pub fn with_defaults() -> Self {
        Self {
            policies: default_policies()
                .into_iter()
                .map(|(category, policy)| (category, Arc::new(policy)))
                .collect(),
        }
    }

    /// 查询策略
    pub fn get(&self, category: &str) -> Result<Arc<Policy>, ShieldError> {
        self.policies
            .get(category)
            .cloned()
            .ok_or_else(|| ShieldError::UnknownCategory(category.to_string()))
    }

    pub fn contains(&self, category: &str) -> bool {
        self.policies.contains_key(category)
    }

    /// 已注册的类别（按名称排序）
    pub fn categories(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// 整体配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    /// 后台清理间隔
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// 计数窗口过期后保留的宽限时间
    #[serde(with = "duration_str")]
    pub sweep_grace: Duration,
    /// 是否信任 X-Forwarded-For
    pub trust_forwarded_for: bool,
    /// 类别策略
    pub categories: HashMap<String, Policy>,
    /// 审计日志配置
    pub audit: AuditLogConfig,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            sweep_grace: Duration::from_secs(DEFAULT_SWEEP_GRACE_SECS),
            trust_forwarded_for: true,
            categories: default_policies(),
            audit: AuditLogConfig::default(),
        }
    }
}

impl ShieldConfig {
    /// 从 YAML 字符串加载
    pub fn from_yaml_str(content: &str) -> Result<Self, ShieldError> {
        let mut config: ShieldConfig = serde_yaml::from_str(content)?;
        config.merge_default_categories();
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 字符串加载
    pub fn from_toml_str(content: &str) -> Result<Self, ShieldError> {
        let mut config: ShieldConfig = toml::from_str(content)?;
        config.merge_default_categories();
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载，按扩展名选择格式
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ShieldError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        let config = match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            Some("toml") => Self::from_toml_str(&content)?,
            _ => {
                return Err(ShieldError::ConfigError(format!(
                    "不支持的配置文件格式: {}",
                    path.display()
                )));
            }
        };

        info!(
            "Loaded rate limit configuration from {} ({} categories)",
            path.display(),
            config.categories.len()
        );
        Ok(config)
    }

    /// 文件中未声明的内置类别保持默认值
    fn merge_default_categories(&mut self) {
        for (category, policy) in default_policies() {
            self.categories.entry(category).or_insert(policy);
        }
    }

    /// 添加或替换类别策略
    pub fn with_policy(mut self, category: &str, policy: Policy) -> Self {
        self.categories.insert(category.to_string(), policy);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn sweep_grace(mut self, grace: Duration) -> Self {
        self.sweep_grace = grace;
        self
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn audit(mut self, audit: AuditLogConfig) -> Self {
        self.audit = audit;
        self
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ShieldError> {
        if self.sweep_interval.is_zero() {
            return Err(ShieldError::ConfigError("清理间隔必须大于0".to_string()));
        }
        if chrono::Duration::from_std(self.sweep_grace).is_err() {
            return Err(ShieldError::ConfigError("清理宽限时间超出范围".to_string()));
        }
        if self.categories.is_empty() {
            return Err(ShieldError::ConfigError("至少需要一个限流类别".to_string()));
        }
        for (category, policy) in &self.categories {
            policy.validate(category)?;
        }
        self.audit.validate()?;

        debug!("Configuration validated: {} categories", self.categories.len());
        Ok(())
    }

    /// 构建类别注册表
    pub fn registry(&self) -> Result<PolicyRegistry, ShieldError> {
        PolicyRegistry::new(self.categories.clone())
    }
}

/// 解析时长字符串
///
/// # 支持的格式
///
/// - `900` - 900秒
/// - `500ms` - 500毫秒
/// - `10s` - 10秒
/// - `5m` - 5分钟
/// - `2h` - 2小时
/// - `1d` - 1天
pub fn parse_duration(value: &str) -> Result<Duration, ShieldError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ShieldError::ConfigError("时长不能为空".to_string()));
    }

    let (num_part, unit_part) =
        value.split_at(value.find(|c: char| c.is_alphabetic()).unwrap_or(value.len()));

    let num_str = num_part.trim();
    let unit = unit_part.trim().to_lowercase();

    if num_str.is_empty() {
        return Err(ShieldError::ConfigError(
            "时长格式错误：缺少数字部分".to_string(),
        ));
    }

    let num: u64 = num_str
        .parse()
        .map_err(|_| ShieldError::ConfigError(format!("无效的数字格式: {}", num_str)))?;

    let secs = |multiplier: u64| {
        num.checked_mul(multiplier)
            .map(Duration::from_secs)
            .ok_or_else(|| ShieldError::ConfigError(format!("时长溢出: {}", value)))
    };

    match unit.as_str() {
        "ms" | "msec" | "millis" => Ok(Duration::from_millis(num)),
        "" | "s" | "sec" | "second" | "seconds" => secs(1),
        "m" | "min" | "minute" | "minutes" => secs(MINUTE_SECS),
        "h" | "hr" | "hour" | "hours" => secs(HOUR_SECS),
        "d" | "day" | "days" => secs(DAY_SECS),
        _ => Err(ShieldError::ConfigError(format!(
            "不支持的单位: {}。支持的单位: ms, s, m, h, d",
            unit
        ))),
    }
}

/// 时长格式化为最大整除单位
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() != 0 {
        return format!("{}ms", duration.as_millis());
    }
    let secs = duration.as_secs();
    if secs != 0 && secs % DAY_SECS == 0 {
        format!("{}d", secs / DAY_SECS)
    } else if secs != 0 && secs % HOUR_SECS == 0 {
        format!("{}h", secs / HOUR_SECS)
    } else if secs != 0 && secs % MINUTE_SECS == 0 {
        format!("{}m", secs / MINUTE_SECS)
    } else {
        format!("{}s", secs)
    }
}

/// serde 适配：时长 <-> 字符串
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Secs(u64),
        Text(String),
    }

    impl Repr {
        fn into_duration(self) -> Result<Duration, String> {
            match self {
                Repr::Secs(secs) => Ok(Duration::from_secs(secs)),
                Repr::Text(text) => super::parse_duration(&text).map_err(|e| e.to_string()),
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Repr::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::Repr;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_str(&super::super::format_duration(*duration)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<Repr>::deserialize(deserializer)?
                .map(|repr| repr.into_duration().map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
