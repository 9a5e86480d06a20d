//! Governor 集成测试
//!
//! 测试标识符解析、响应头、审计事件和管理接口

use crate::common::{
    anonymous_request, create_governor_with, create_test_governor, test_start, user_request,
};
use rateshield::CounterStore;
use rateshield::audit_log::AuditAction;
use rateshield::config::ShieldConfig;
use rateshield::constants::*;
use rateshield::error::{Decision, RejectReason, ShieldError};
use rateshield::identifier::{Identifier, RequestContext};
use std::time::Duration;

/// 转发链的第一个地址作为标识符
#[tokio::test]
async fn test_forwarded_chain_identifies_client() {
    let t = create_test_governor();
    let ctx = RequestContext::new()
        .with_remote_addr("10.0.0.1")
        .with_forwarded_for("203.0.113.7, 10.0.0.1");

    let admission = t
        .governor
        .check(CATEGORY_GENERAL, &ctx)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(
        admission.identifier,
        Identifier::Ip("203.0.113.7".to_string())
    );
    assert!(t
        .storage
        .get_entry("general:ip:203.0.113.7")
        .await
        .unwrap()
        .is_some());
}

/// 不信任转发头时使用对端地址
#[tokio::test]
async fn test_untrusted_forwarded_chain() {
    let t = create_governor_with(ShieldConfig::default().trust_forwarded_for(false));
    let ctx = RequestContext::new()
        .with_remote_addr("10.0.0.1")
        .with_forwarded_for("203.0.113.7");

    let admission = t
        .governor
        .check(CATEGORY_GENERAL, &ctx)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(admission.identifier, Identifier::Ip("10.0.0.1".to_string()));
}

/// 用户与地址分别计数
#[tokio::test]
async fn test_user_and_address_counted_separately() {
    let t = create_test_governor();

    for _ in 0..3 {
        t.governor
            .check(CATEGORY_PASSWORD_RESET, &user_request("42", "10.0.0.1"))
            .await
            .unwrap();
    }
    assert!(!t
        .governor
        .check(CATEGORY_PASSWORD_RESET, &user_request("42", "10.0.0.1"))
        .await
        .unwrap()
        .is_allowed());

    // 同一地址的匿名请求使用 ip: 标识符
    assert!(t
        .governor
        .check(CATEGORY_PASSWORD_RESET, &anonymous_request("10.0.0.1"))
        .await
        .unwrap()
        .is_allowed());
}

/// 允许和拒绝都携带配额头
#[tokio::test]
async fn test_headers_on_allow_and_reject() {
    let t = create_test_governor();
    let ctx = anonymous_request("10.0.0.1");

    for expected in (0..5).rev() {
        let admission = t
            .governor
            .check(CATEGORY_EXPORT, &ctx)
            .await
            .unwrap()
            .into_result()
            .unwrap();
        let headers = admission.header_pairs();
        assert_eq!(headers[0], (HEADER_LIMIT, "5".to_string()));
        assert_eq!(headers[1], (HEADER_REMAINING, expected.to_string()));
        assert_eq!(
            headers[2],
            (HEADER_RESET, "2026-03-01T10:00:00.000Z".to_string())
        );
    }

    let Decision::Rejected(rejection) = t.governor.check(CATEGORY_EXPORT, &ctx).await.unwrap()
    else {
        panic!("expected a rejection");
    };
    let headers = rejection.header_pairs();
    assert_eq!(headers[1], (HEADER_REMAINING, "0".to_string()));
    // export 超限封禁 24 小时
    assert_eq!(
        headers[2],
        (HEADER_RESET, "2026-03-02T09:00:00.000Z".to_string())
    );
    assert_eq!(headers[3], (HEADER_RETRY_AFTER, "86400".to_string()));
}

/// 普通节流与临时封禁的文案不同
#[tokio::test]
async fn test_denial_wording() {
    let t = create_test_governor();
    let ctx = user_request("7", "10.0.0.1");

    for _ in 0..3 {
        t.governor
            .check(CATEGORY_API_KEY_ISSUANCE, &ctx)
            .await
            .unwrap();
    }
    let error = t
        .governor
        .check(CATEGORY_API_KEY_ISSUANCE, &ctx)
        .await
        .unwrap()
        .into_result()
        .unwrap_err();

    match error {
        ShieldError::TooManyRequests {
            message,
            reset_at,
            blocked,
        } => {
            assert!(!blocked);
            assert_eq!(reset_at, test_start() + chrono::Duration::hours(24));
            assert!(message.starts_with("Too many requests"));
            assert!(message.contains("2026-03-02 09:00:00 UTC"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

/// 被封禁地址的请求产生 blocked_request 审计事件
#[tokio::test]
async fn test_blocked_request_audit_event() {
    let t = create_test_governor();
    t.governor
        .manually_block_ip("203.0.113.9", Duration::from_secs(600), "ops")
        .await
        .unwrap();

    let ctx = RequestContext::new()
        .with_forwarded_for("203.0.113.9")
        .with_path("/api/export")
        .with_method("GET")
        .with_user_agent("curl/8.5");
    let decision = t.governor.check(CATEGORY_EXPORT, &ctx).await.unwrap();
    let Decision::Rejected(rejection) = decision else {
        panic!("expected a rejection");
    };
    assert_eq!(rejection.reason, RejectReason::IpBlocked);
    assert_eq!(rejection.identifier, "ip:203.0.113.9");

    let events = t.audit.events();
    let event = events
        .iter()
        .find(|e| e.action == AuditAction::BlockedRequest)
        .unwrap();
    assert_eq!(event.user_id, "anonymous");
    assert_eq!(event.resource, "rate_limit");
    assert_eq!(event.ip_address, "203.0.113.9");
    assert_eq!(event.user_agent.as_deref(), Some("curl/8.5"));
    assert_eq!(event.details["reason"], "ip_blocked");
    assert_eq!(event.details["category"], "export");
    assert_eq!(event.details["path"], "/api/export");
    assert_eq!(event.details["address"], "203.0.113.9");
}

/// 直接计数接口不检查地址封禁，也不发审计事件
#[tokio::test]
async fn test_evaluate_contract() {
    let t = create_test_governor();
    t.governor
        .manually_block_ip("10.0.0.1", Duration::from_secs(600), "ops")
        .await
        .unwrap();

    let identifier = Identifier::Ip("10.0.0.1".to_string());
    let verdict = t
        .governor
        .evaluate(CATEGORY_DOWNLOAD, &identifier)
        .await
        .unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.remaining, 49);
    assert_eq!(t.audit.events().len(), 1);

    assert!(matches!(
        t.governor.evaluate("unknown", &identifier).await,
        Err(ShieldError::UnknownCategory(_))
    ));
}

/// 清除地址标识符的状态
#[tokio::test]
async fn test_clear_identifier_state() {
    let t = create_test_governor();
    let ip = Identifier::Ip("10.0.0.1".to_string());

    for category in [CATEGORY_GENERAL, CATEGORY_PHI, CATEGORY_DOWNLOAD] {
        t.governor.evaluate(category, &ip).await.unwrap();
    }
    t.governor
        .evaluate(CATEGORY_GENERAL, &Identifier::Ip("10.0.0.10".to_string()))
        .await
        .unwrap();

    assert_eq!(t.governor.clear_identifier_state(&ip).await.unwrap(), 3);
    assert_eq!(t.governor.stats().await.unwrap().total_entries, 1);

    let events = t.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, AuditAction::ClearRateLimits);
    assert_eq!(events[0].details["removed"], 3);
    assert_eq!(events[0].details["identifier"], "ip:10.0.0.1");
}

/// 统计只计算有效封禁
#[tokio::test]
async fn test_stats_counts_live_blocks_only() {
    let t = create_test_governor();
    let ctx = user_request("9", "10.0.0.1");

    for _ in 0..4 {
        t.governor.check(CATEGORY_PASSWORD_RESET, &ctx).await.unwrap();
    }
    t.governor
        .manually_block_ip("10.0.0.2", Duration::from_secs(60), "ops")
        .await
        .unwrap();

    let stats = t.governor.stats().await.unwrap();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.blocked_entries, 1);
    assert_eq!(stats.blocked_ips, 1);

    t.clock.advance(Duration::from_secs(61 * 60));
    let stats = t.governor.stats().await.unwrap();
    assert_eq!(stats.blocked_entries, 0);
    assert_eq!(stats.blocked_ips, 0);
}
