//! 端到端测试：多规则级联
//!
//! 测试场景：
//! - 规则1: 全局限流 Global，20/分钟
//! - 规则2: 租户限流 Tenant，5/分钟；VIP 租户通过覆盖项提升到 8
//! - 规则3: 租户 + 接口限流 Api，3/分钟

use crate::common::*;
use quotaguard::config::{EngineConfig, Override, Rule};
use quotaguard::governor::Governor;
use quotaguard::key::QuotaKey;
use std::time::Duration;

fn cascade_rules() -> Vec<Rule> {
    let minute = Duration::from_secs(60);
    vec![
        Rule::new("Global", "global", 20, minute),
        Rule::new("Tenant", "tenant:${tenant_id}", 5, minute)
            .with_override(Override::new("tenant:vip-*", 8)),
        Rule::new("Api", "api:${tenant_id}:${method}:${path}", 3, minute),
    ]
}

fn request(tenant_id: &str, method: &str, path: &str) -> QuotaKey {
    QuotaKey::new()
        .with_tenant(tenant_id)
        .with_caller("gateway")
        .with_method(method)
        .with_path(path)
}

fn setup() -> Governor {
    let config = EngineConfig::builder()
        .key_prefix("e2e:")
        .rules(cascade_rules())
        .build()
        .unwrap();
    Governor::local(&config).unwrap()
}

#[tokio::test]
async fn test_api_rule_binds_first() {
    init_tracing();
    let governor = setup();
    let orders = request("acme", "GET", "/orders");

    for expected_remaining in [2, 1, 0] {
        let result = governor.evaluate(&orders).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.rule, "Api");
        assert_eq!(result.remaining, expected_remaining);
    }

    let denied = governor.evaluate(&orders).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.rule, "Api");
    assert_eq!(denied.key, "api:acme:GET:/orders");
}

#[tokio::test]
async fn test_tenant_rule_binds_across_endpoints() {
    let governor = setup();

    // 5 个请求分散到不同接口，Api 规则都不会触发
    for path in ["/a", "/b", "/c", "/d", "/e"] {
        let result = governor
            .evaluate(&request("acme", "GET", path))
            .await
            .unwrap();
        assert!(result.allowed);
    }

    let sixth = governor
        .evaluate(&request("acme", "GET", "/f"))
        .await
        .unwrap();
    assert!(!sixth.allowed);
    assert_eq!(sixth.rule, "Tenant");
    assert_eq!(sixth.key, "tenant:acme");
}

#[tokio::test]
async fn test_vip_override_raises_tenant_ceiling() {
    let governor = setup();

    let mut admitted = 0;
    for i in 0..12 {
        let key = request("vip-corp", "POST", &format!("/jobs/{}", i));
        if governor.evaluate(&key).await.unwrap().allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 8);
}

#[tokio::test]
async fn test_global_rule_binds_across_tenants() {
    let governor = setup();

    let mut admitted = 0;
    let mut last_denial = None;
    for t in 0..10 {
        for p in 0..3 {
            let key = request(&format!("t{}", t), "GET", &format!("/p{}", p));
            let result = governor.evaluate(&key).await.unwrap();
            if result.allowed {
                admitted += 1;
            } else {
                last_denial = Some(result.rule);
            }
        }
    }

    assert_eq!(admitted, 20);
    assert_eq!(last_denial.as_deref(), Some("Global"));
}

#[tokio::test]
async fn test_reset_restores_all_layers_for_key() {
    let governor = setup();
    let orders = request("acme", "GET", "/orders");

    for _ in 0..3 {
        governor.evaluate(&orders).await.unwrap();
    }
    assert!(!governor.evaluate(&orders).await.unwrap().allowed);

    governor.reset(&orders).await.unwrap();
    let info = governor.query(&orders).await.unwrap();
    assert_eq!(info.rule, "Api");
    assert_eq!(info.remaining, 3);

    let result = governor.evaluate(&orders).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 2);
}

#[tokio::test]
async fn test_hot_rule_update_takes_effect() {
    let governor = setup();
    let key = request("acme", "GET", "/orders");

    for _ in 0..3 {
        governor.evaluate(&key).await.unwrap();
    }
    assert!(!governor.evaluate(&key).await.unwrap().allowed);

    // 去掉 Api 规则
    let rules: Vec<_> = cascade_rules()
        .into_iter()
        .filter(|r| r.name != "Api")
        .collect();
    governor.update_rules(rules).unwrap();

    let result = governor.evaluate(&key).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.rule, "Tenant");
}
