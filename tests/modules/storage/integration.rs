//! 存储模块集成测试
//!
//! 通过 trait 对象使用内存存储，覆盖窗口、封禁和并发语义

use crate::common::test_start;
use rateshield::config::{default_policies, Policy};
use rateshield::constants::*;
use rateshield::storage::{BlockSource, BlockStore, CounterStore, MemoryStorage};
use std::sync::Arc;
use std::time::Duration;

fn stores() -> (Arc<dyn CounterStore>, Arc<dyn BlockStore>) {
    let storage = Arc::new(MemoryStorage::new());
    (storage.clone(), storage)
}

/// 每个内置类别：恰好 max 次允许，第 max+1 次拒绝
#[tokio::test]
async fn test_every_default_category_admits_exactly_max() {
    let (counters, _) = stores();
    let now = test_start();

    for (category, policy) in default_policies() {
        let key = format!("{}:user:1", category);
        for i in 1..=policy.max_requests {
            let verdict = counters.evaluate(&key, &policy, now).await.unwrap();
            assert!(verdict.allowed, "{} request {} should pass", category, i);
            assert_eq!(verdict.remaining, policy.max_requests - i);
        }

        let verdict = counters.evaluate(&key, &policy, now).await.unwrap();
        assert!(!verdict.allowed, "{} should deny past the limit", category);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(verdict.blocked, policy.block_duration.is_some());
    }
}

/// 不同类别、不同标识符互不影响
#[tokio::test]
async fn test_keys_are_independent() {
    let (counters, _) = stores();
    let policy = Policy::new(Duration::from_secs(60), 1);
    let now = test_start();

    assert!(counters.evaluate("auth:user:1", &policy, now).await.unwrap().allowed);
    assert!(!counters.evaluate("auth:user:1", &policy, now).await.unwrap().allowed);
    assert!(counters.evaluate("auth:user:2", &policy, now).await.unwrap().allowed);
    assert!(counters.evaluate("export:user:1", &policy, now).await.unwrap().allowed);
}

/// 封禁期间跨越多个窗口依然拒绝，到期后从新窗口开始
#[tokio::test]
async fn test_block_outlasts_window_rollover() {
    let (counters, _) = stores();
    let policy = Policy::new(Duration::from_secs(60), 2).with_block(Duration::from_secs(600));
    let start = test_start();

    for _ in 0..3 {
        counters.evaluate("k", &policy, start).await.unwrap();
    }

    for minute in [2, 5, 9] {
        let now = start + chrono::Duration::minutes(minute);
        let verdict = counters.evaluate("k", &policy, now).await.unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.blocked);
        assert_eq!(verdict.reset_at, start + chrono::Duration::minutes(10));
    }

    let expiry = start + chrono::Duration::minutes(10);
    let verdict = counters.evaluate("k", &policy, expiry).await.unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.remaining, 1);
    assert_eq!(verdict.reset_at, expiry + chrono::Duration::minutes(1));
}

/// 封禁列表与计数器相互独立
#[tokio::test]
async fn test_block_list_is_category_agnostic() {
    let (counters, blocks) = stores();
    let now = test_start();

    blocks
        .block(
            "203.0.113.7",
            chrono::Duration::minutes(30),
            now,
            BlockSource::Escalation {
                category: CATEGORY_AUTH.to_string(),
            },
        )
        .await
        .unwrap();

    assert!(blocks.is_blocked("203.0.113.7", now).await.unwrap());
    assert!(!blocks.is_blocked("203.0.113.8", now).await.unwrap());
    assert_eq!(counters.counter_stats(now).await.unwrap().total_entries, 0);
}

/// 并发：max+K 个请求中恰好 max 个被允许
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_admission_is_exact() {
    let (counters, _) = stores();
    let policy = Arc::new(
        Policy::new(Duration::from_secs(900), 100).with_block(Duration::from_secs(1800)),
    );
    let now = test_start();

    let mut handles = Vec::new();
    for _ in 0..137 {
        let counters = counters.clone();
        let policy = policy.clone();
        handles.push(tokio::spawn(async move {
            counters
                .evaluate("auth:ip:203.0.113.7", &policy, now)
                .await
                .unwrap()
        }));
    }

    let mut allowed = 0;
    let mut newly_blocked = 0;
    for handle in handles {
        let verdict = handle.await.unwrap();
        if verdict.allowed {
            allowed += 1;
        }
        if verdict.newly_blocked {
            newly_blocked += 1;
        }
    }

    assert_eq!(allowed, 100);
    // 只有一个请求触发封禁
    assert_eq!(newly_blocked, 1);
}

/// 清理与并发计数同时进行
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_during_traffic() {
    let (counters, _) = stores();
    let policy = Arc::new(Policy::new(Duration::from_secs(60), 1_000));
    let start = test_start();

    for i in 0..200 {
        counters
            .evaluate(&format!("general:user:{}", i), &policy, start)
            .await
            .unwrap();
    }

    let later = start + chrono::Duration::minutes(2);
    let traffic = {
        let counters = counters.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                counters
                    .evaluate("general:user:live", &policy, later)
                    .await
                    .unwrap();
            }
        })
    };
    let removed = counters
        .sweep_counters(later, chrono::Duration::zero())
        .await
        .unwrap();
    traffic.await.unwrap();

    assert_eq!(removed, 200);
    let entry = counters.get_entry("general:user:live").await.unwrap().unwrap();
    assert_eq!(entry.count, 200);
}
