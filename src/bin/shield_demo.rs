//! 限流演示
//!
//! 在手动时钟上重现认证类别的升级封禁流程：
//! 5 次失败登录全部放行，第 6 次触发账户和地址封禁，封禁期间其他类别同样被拒绝，
//! 封禁到期后恢复。
//!
//! 用法：`cargo run --features telemetry --bin shield_demo [config.yaml]`

use anyhow::Context;
use rateshield::audit_log::AuditLogger;
use rateshield::constants::{CATEGORY_AUTH, CATEGORY_GENERAL};
use rateshield::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(None)?;

    let config = match std::env::args().nth(1) {
        Some(path) => ShieldConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => ShieldConfig::default(),
    };

    println!("=== RateShield 演示 ===");
    println!("类别: {:?}", config.registry()?.categories());

    let audit = Arc::new(AuditLogger::new(config.audit.clone()).await);
    let clock = Arc::new(ManualClock::starting_now());
    let storage = Arc::new(MemoryStorage::new());
    let governor = Governor::new(
        config,
        storage.clone(),
        storage,
        audit.clone(),
        clock.clone(),
    )?;

    let login = RequestContext::new()
        .with_user_id("42")
        .with_remote_addr("10.0.0.1")
        .with_forwarded_for("203.0.113.7, 10.0.0.1")
        .with_path("/api/auth/login")
        .with_method("POST")
        .with_user_agent("shield-demo/0.1");

    println!("\n--- 连续失败登录 ---");
    for attempt in 1..=6 {
        match governor.check(CATEGORY_AUTH, &login).await? {
            Decision::Allowed(admission) => {
                admission.finalize(401).await?;
                println!(
                    "第 {} 次: 允许 (剩余 {})",
                    attempt, admission.headers.remaining
                );
            }
            Decision::Rejected(rejection) => {
                println!("第 {} 次: 拒绝 - {}", attempt, rejection.message);
                for (name, value) in rejection.header_pairs() {
                    println!("    {}: {}", name, value);
                }
            }
        }
    }

    println!("\n--- 同一地址访问其他类别 ---");
    let browse = RequestContext::new()
        .with_forwarded_for("203.0.113.7")
        .with_path("/api/patients");
    let decision = governor.check(CATEGORY_GENERAL, &browse).await?;
    println!("general: 允许={}", decision.is_allowed());

    let stats = governor.stats().await?;
    println!("\n统计: {}", serde_json::to_string(&stats)?);

    println!("\n--- 30 分钟后 ---");
    clock.advance(Duration::from_secs(30 * 60));
    let decision = governor.check(CATEGORY_GENERAL, &browse).await?;
    println!("general: 允许={}", decision.is_allowed());
    let decision = governor.check(CATEGORY_AUTH, &login).await?;
    println!("auth: 允许={}", decision.is_allowed());

    let report = governor.sweep_now().await?;
    println!(
        "清理: 计数条目 {}，封禁条目 {}",
        report.counters_removed, report.blocks_removed
    );

    audit.shutdown().await;
    println!(
        "\n审计事件: 共 {} 条（封禁命中 {}，超限 {}）",
        audit.stats().total_events(),
        audit.stats().blocked_request_events(),
        audit.stats().rate_limit_events()
    );

    Ok(())
}
