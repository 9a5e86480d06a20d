//! 配置模块集成测试
//!
//! 测试配置文件加载、默认类别合并以及启动时校验

use rateshield::audit_log::NullAuditSink;
use rateshield::config::{Policy, ShieldConfig};
use rateshield::constants::*;
use rateshield::error::ShieldError;
use rateshield::governor::Governor;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn write_config(extension: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(extension)
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// 测试从YAML文件加载并覆盖内置类别
#[test]
fn test_load_yaml_file() {
    let file = write_config(
        ".yaml",
        r#"
sweep_interval: 1m
sweep_grace: 30s
trust_forwarded_for: false
categories:
  auth:
    window: 10m
    max_requests: 3
    block_duration: 1h
    count_only_failures: true
    escalate_to_ip_block: true
  search:
    window: 60
    max_requests: 30
audit:
  batch_size: 10
  batch_timeout: 2s
"#,
    );

    let config = ShieldConfig::from_file(file.path()).unwrap();
    assert_eq!(config.sweep_interval, Duration::from_secs(60));
    assert_eq!(config.sweep_grace, Duration::from_secs(30));
    assert!(!config.trust_forwarded_for);
    assert_eq!(config.audit.batch_size, 10);
    assert_eq!(config.audit.batch_timeout, Duration::from_secs(2));

    let registry = config.registry().unwrap();
    let auth = registry.get(CATEGORY_AUTH).unwrap();
    assert_eq!(auth.window, Duration::from_secs(600));
    assert_eq!(auth.max_requests, 3);
    assert_eq!(auth.block_duration, Some(Duration::from_secs(3600)));

    let search = registry.get("search").unwrap();
    assert_eq!(search.window, Duration::from_secs(60));
    assert!(search.block_duration.is_none());

    // 未声明的内置类别保持默认
    let export = registry.get(CATEGORY_EXPORT).unwrap();
    assert_eq!(export.max_requests, 5);
    assert_eq!(export.block_duration, Some(Duration::from_secs(DAY_SECS)));
    assert_eq!(registry.len(), 8);
}

/// 测试从TOML文件加载
#[test]
fn test_load_toml_file() {
    let file = write_config(
        ".toml",
        r#"
sweep_interval = "10m"

[categories.reports]
window = "1h"
max_requests = 12
block_duration = "2h"
"#,
    );

    let config = ShieldConfig::from_file(file.path()).unwrap();
    assert_eq!(config.sweep_interval, Duration::from_secs(600));
    assert!(config.trust_forwarded_for);

    let reports = config.registry().unwrap().get("reports").unwrap();
    assert_eq!(reports.max_requests, 12);
    assert_eq!(reports.block_duration, Some(Duration::from_secs(7200)));
}

/// 测试不支持的扩展名
#[test]
fn test_unsupported_extension() {
    let file = write_config(".ini", "sweep_interval=1m");
    let result = ShieldConfig::from_file(file.path());
    assert!(matches!(result, Err(ShieldError::ConfigError(_))));
}

/// 测试文件中的非法策略在加载时被拒绝
#[test]
fn test_invalid_policy_in_file() {
    let file = write_config(
        ".yml",
        r#"
categories:
  broken:
    window: 0s
    max_requests: 10
"#,
    );
    assert!(matches!(
        ShieldConfig::from_file(file.path()),
        Err(ShieldError::ConfigError(_))
    ));

    let file = write_config(
        ".yml",
        r#"
categories:
  broken:
    window: 1m
    max_requests: 10
    escalate_to_ip_block: true
"#,
    );
    assert!(matches!(
        ShieldConfig::from_file(file.path()),
        Err(ShieldError::ConfigError(_))
    ));
}

/// 测试无法解析的时长
#[test]
fn test_bad_duration_string() {
    let result = ShieldConfig::from_yaml_str(
        r#"
categories:
  broken:
    window: 5 fortnights
    max_requests: 10
"#,
    );
    assert!(matches!(result, Err(ShieldError::YamlError(_))));
}

/// 测试Governor在启动时校验配置
#[test]
fn test_governor_rejects_invalid_config() {
    let config = ShieldConfig::default()
        .with_policy("bad:name", Policy::new(Duration::from_secs(60), 1));
    let result = Governor::in_memory(config, Arc::new(NullAuditSink));
    assert!(matches!(result, Err(ShieldError::ConfigError(_))));

    let config = ShieldConfig::default().sweep_interval(Duration::ZERO);
    let result = Governor::in_memory(config, Arc::new(NullAuditSink));
    assert!(matches!(result, Err(ShieldError::ConfigError(_))));
}

/// 测试配置序列化后可以重新加载
#[test]
fn test_yaml_serialization_reloads() {
    let config = ShieldConfig::default()
        .with_policy(
            "uploads",
            Policy::new(Duration::from_secs(300), 20).with_block(Duration::from_secs(900)),
        )
        .sweep_grace(Duration::from_secs(60));

    let yaml = serde_yaml::to_string(&config).unwrap();
    let reloaded = ShieldConfig::from_yaml_str(&yaml).unwrap();

    assert_eq!(reloaded.categories, config.categories);
    assert_eq!(reloaded.sweep_grace, Duration::from_secs(60));
}

/// 测试超出上限的策略时长在加载时被拒绝
#[test]
fn test_oversized_policy_duration_rejected() {
    let result = ShieldConfig::from_yaml_str(
        r#"
categories:
  archive:
    window: 100000000d
    max_requests: 10
"#,
    );
    assert!(matches!(result, Err(ShieldError::ConfigError(_))));

    let config = ShieldConfig::default().with_policy(
        "archive",
        Policy::new(Duration::from_secs(60), 10)
            .with_block(Duration::from_secs(MAX_POLICY_DURATION_SECS + 1)),
    );
    let result = Governor::in_memory(config, Arc::new(NullAuditSink));
    assert!(matches!(result, Err(ShieldError::ConfigError(_))));
}

/// 测试上限内的最长策略可以正常判决
#[tokio::test]
async fn test_max_policy_duration_is_usable() {
    let max = Duration::from_secs(MAX_POLICY_DURATION_SECS);
    let config = ShieldConfig::default()
        .with_policy("archive", Policy::new(max, 1).with_block(max));
    let governor = Governor::in_memory(config, Arc::new(NullAuditSink)).unwrap();
    let ctx = rateshield::identifier::RequestContext::new().with_remote_addr("10.0.0.1");

    assert!(governor.check("archive", &ctx).await.unwrap().is_allowed());
    assert!(!governor.check("archive", &ctx).await.unwrap().is_allowed());
}
