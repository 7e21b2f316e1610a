//! 评估核心集成测试

use crate::common::*;
use quotaguard::config::{EngineConfig, Override, Rule};
use quotaguard::constants::{ERROR_RULE_LABEL, HEADER_RETRY_AFTER};
use quotaguard::error::QuotaGuardError;
use quotaguard::governor::Governor;
use quotaguard::key::QuotaKey;
use quotaguard::limiters::{LocalBackend, StaticReplicaCount};
use quotaguard::storage::DistributedBackend;
use quotaguard::telemetry::Hooks;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_sixth_tenant_request_denied_by_tenant_rule() {
    let governor = Governor::local(&config_with(layered_rules())).unwrap();
    let key = tenant("acme");

    for i in 0..5 {
        let result = governor.evaluate(&key).await.unwrap();
        assert!(result.allowed, "request {} should be admitted", i + 1);
    }

    let sixth = governor.evaluate(&key).await.unwrap();
    assert!(!sixth.allowed);
    assert_eq!(sixth.rule, "Tenant");
    assert!(sixth.retry_after > Duration::ZERO);

    // Global 仍有余量
    let other = governor.evaluate(&tenant("globex")).await.unwrap();
    assert!(other.allowed);
}

#[tokio::test]
async fn test_tightest_rule_reported_when_all_admit() {
    let rules = vec![
        Rule::new("Wide", "wide:${tenant_id}", 11, Duration::from_secs(60)),
        Rule::new("Narrow", "narrow:${tenant_id}", 4, Duration::from_secs(60)),
    ];
    let governor = Governor::local(&config_with(rules)).unwrap();

    let result = governor.evaluate(&tenant("acme")).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 3);
    assert_eq!(result.rule, "Narrow");
    assert_eq!(result.key, "narrow:acme");
}

#[tokio::test]
async fn test_evaluation_is_not_atomic_across_rules() {
    let store = MockDistributedStore::new();
    let rules = vec![
        Rule::new("Global", "global", 100, Duration::from_secs(60)),
        Rule::new("Tenant", "tenant:${tenant_id}", 1, Duration::from_secs(60)),
    ];
    let governor = Governor::new(
        &config_with(rules),
        Arc::new(DistributedBackend::new(store.clone(), None)),
        Hooks::default(),
    )
    .unwrap();

    let key = tenant("acme");
    assert!(governor.evaluate(&key).await.unwrap().allowed);
    assert!(!governor.evaluate(&key).await.unwrap().allowed);

    // 第二次请求被 Tenant 拒绝，但 Global 的配额已经消耗
    assert_eq!(store.used("test:Global:global"), 2);
    assert_eq!(store.used("test:Tenant:tenant:acme"), 1);
}

#[tokio::test]
async fn test_evaluate_n_consumes_n_tokens() {
    let governor = Governor::local(&config_with(layered_rules())).unwrap();
    let key = tenant("acme");

    let result = governor.evaluate_n(&key, 4).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.remaining, 1);

    let result = governor.evaluate_n(&key, 2).await.unwrap();
    assert!(!result.allowed);
}

#[tokio::test]
async fn test_overrides_resolved_per_rendered_key() {
    let rule = Rule::new("Tenant", "tenant:${tenant_id}", 1, Duration::from_secs(60))
        .with_override(Override::new("tenant:vip-*", 3))
        .with_override(Override::new("tenant:vip-corp", 10));
    let governor = Governor::local(&config_with(vec![rule])).unwrap();

    let vip = tenant("vip-corp");
    let first = governor.evaluate(&vip).await.unwrap();
    assert_eq!(first.limit, 3);

    let basic = governor.evaluate(&tenant("basic")).await.unwrap();
    assert_eq!(basic.limit, 1);
}

#[tokio::test]
async fn test_observer_and_callbacks() {
    let observer = CountingObserver::new();
    let admitted = Arc::new(AtomicUsize::new(0));
    let denied = Arc::new(AtomicUsize::new(0));

    let hooks = {
        let admitted = admitted.clone();
        let denied = denied.clone();
        Hooks::new()
            .with_observer(observer.clone())
            .on_admit(move |_, _| {
                admitted.fetch_add(1, Ordering::SeqCst);
            })
            .on_deny(move |key, result| {
                assert_eq!(key.tenant_id, "acme");
                assert_eq!(result.rule, "Tenant");
                denied.fetch_add(1, Ordering::SeqCst);
            })
    };

    let config = config_with(layered_rules());
    let governor =
        Governor::local_with(&config, Arc::new(StaticReplicaCount(1)), hooks).unwrap();
    let key = tenant("acme");
    for _ in 0..7 {
        governor.evaluate(&key).await.unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 5);
    assert_eq!(denied.load(Ordering::SeqCst), 2);
    assert_eq!(observer.admitted(), 5);
    assert_eq!(observer.denied(), 2);
    assert!(observer
        .admissions
        .lock()
        .iter()
        .all(|(backend, _, _)| backend == "local"));
}

#[tokio::test]
async fn test_errors_recorded_with_error_label() {
    let store = MockDistributedStore::new();
    store.go_down();
    let observer = CountingObserver::new();
    let governor = Governor::new(
        &config_with(layered_rules()),
        Arc::new(DistributedBackend::new(store, None)),
        Hooks::new().with_observer(observer.clone()),
    )
    .unwrap();

    let err = governor.evaluate(&tenant("acme")).await.unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(observer.rules(), vec![ERROR_RULE_LABEL]);
    assert_eq!(observer.denied(), 1);
}

#[tokio::test]
async fn test_metrics_toggle_disables_observer() {
    let observer = CountingObserver::new();
    let config = EngineConfig::builder()
        .rules(layered_rules())
        .enable_metrics(false)
        .build()
        .unwrap();
    let governor = Governor::new(
        &config,
        Arc::new(LocalBackend::new(100)),
        Hooks::new().with_observer(observer.clone()),
    )
    .unwrap();

    governor.evaluate(&tenant("acme")).await.unwrap();
    assert!(observer.admissions.lock().is_empty());
}

#[tokio::test]
async fn test_tracing_span_enabled() {
    init_tracing();
    let config = EngineConfig::builder()
        .rules(layered_rules())
        .enable_tracing(true)
        .build()
        .unwrap();
    let governor = Governor::local(&config).unwrap();

    let result = governor.evaluate(&tenant("acme")).await.unwrap();
    assert!(result.allowed);
}

#[tokio::test]
async fn test_denied_headers_include_retry_after() {
    let governor = Governor::local(&config_with(vec![Rule::new(
        "One",
        "one",
        1,
        Duration::from_secs(30),
    )]))
    .unwrap();
    let key = QuotaKey::new();

    governor.evaluate(&key).await.unwrap();
    let denied = governor.evaluate(&key).await.unwrap();
    let headers = governor.response_headers(&denied);

    let retry = headers
        .iter()
        .find(|(name, _)| *name == HEADER_RETRY_AFTER)
        .map(|(_, value)| value.parse::<u64>().unwrap());
    assert!(matches!(retry, Some(secs) if secs >= 29 && secs <= 30));
}

#[tokio::test]
async fn test_governor_from_yaml_config() {
    let yaml = r#"
key_prefix: "svc:"
max_local_keys: 2
rules:
  - name: tenant
    key_template: "tenant:${tenant_id}"
    limit: 2
    window: 1m
"#;
    let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
    let governor = Governor::local(&config).unwrap();

    assert!(governor.evaluate(&tenant("a")).await.unwrap().allowed);
    assert!(governor.evaluate(&tenant("b")).await.unwrap().allowed);
    // 第三个不同的键超过上限
    let third = governor.evaluate(&tenant("c")).await.unwrap();
    assert!(!third.allowed);
    assert_eq!(third.rule, "tenant");
}

#[tokio::test]
async fn test_invalid_config_rejected_at_construction() {
    let mut config = config_with(layered_rules());
    config.rules.push(Rule::new("Broken", "", 1, Duration::from_secs(1)));

    assert!(matches!(
        Governor::local(&config),
        Err(QuotaGuardError::ConfigError(_))
    ));
}

#[tokio::test]
async fn test_matching_rules_discovery() {
    let governor = Governor::local(&config_with(layered_rules())).unwrap();
    let names: Vec<_> = governor
        .matching_rules(&QuotaKey::new())
        .iter()
        .map(|r| r.name.clone())
        .collect();
    assert_eq!(names, vec!["Global"]);
}
