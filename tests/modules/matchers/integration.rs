//! 规则匹配器集成测试

use crate::common::*;
use quotaguard::config::{Override, Rule};
use quotaguard::error::QuotaGuardError;
use quotaguard::key::QuotaKey;
use quotaguard::matchers::{wildcard_match, RuleMatcher};
use std::time::Duration;

fn tenant_rule() -> Rule {
    Rule::new("Tenant", "tenant:${tenant_id}", 100, Duration::from_secs(60))
        .with_burst(150)
        .with_override(Override::new("tenant:vip-*", 500))
        .with_override(Override::new("tenant:vip-corp", 1000))
        .with_override(
            Override::new("tenant:batch-*", 20)
                .with_window(Duration::from_secs(1))
                .with_burst(40),
        )
}

#[test]
fn test_first_override_wins_over_more_specific() {
    let matcher = RuleMatcher::new(vec![tenant_rule()]).unwrap();
    let rule = matcher.get("Tenant").unwrap();

    let rendered = tenant("vip-corp").render(&rule.key_template);
    assert_eq!(rendered, "tenant:vip-corp");

    let limit = matcher.resolve(rule, &rendered);
    assert_eq!(limit.limit, 500);
}

#[test]
fn test_override_inherits_rule_window_and_burst() {
    let matcher = RuleMatcher::new(vec![tenant_rule()]).unwrap();
    let rule = matcher.get("Tenant").unwrap();

    let vip = matcher.resolve(rule, "tenant:vip-1");
    assert_eq!(vip.window, Duration::from_secs(60));
    assert_eq!(vip.burst, 150);

    let batch = matcher.resolve(rule, "tenant:batch-7");
    assert_eq!(batch.limit, 20);
    assert_eq!(batch.window, Duration::from_secs(1));
    assert_eq!(batch.burst, 40);

    let plain = matcher.resolve(rule, "tenant:acme");
    assert_eq!(plain.limit, 100);
    assert_eq!(plain.burst, 150);

    let stats = matcher.stats();
    assert_eq!(stats.override_hits, 2);
    assert_eq!(stats.default_hits, 1);
}

#[test]
fn test_override_must_match_whole_rendered_key() {
    let matcher = RuleMatcher::new(vec![tenant_rule()]).unwrap();
    let rule = matcher.get("Tenant").unwrap();

    // 前缀相同但模式要求完整匹配
    assert_eq!(matcher.resolve(rule, "tenant:vip-corp:eu").limit, 500);
    assert_eq!(matcher.resolve(rule, "xtenant:vip-corp").limit, 100);
}

#[test]
fn test_wildcard_matching_cases() {
    let cases = [
        ("*", "", true),
        ("*", "anything", true),
        ("", "", true),
        ("", "a", false),
        ("a*b*c", "abc", true),
        ("a*b*c", "a--b--c", true),
        ("a*b*c", "a--c--b", false),
        ("*corp", "tenant:vip-corp", true),
        ("tenant:*:GET", "tenant:acme:GET", true),
        ("tenant:*:GET", "tenant:acme:POST", false),
        ("**", "x", true),
        ("exact", "exact", true),
        ("exact", "exactly", false),
    ];

    for (pattern, text, expected) in cases {
        assert_eq!(
            wildcard_match(pattern, text),
            expected,
            "pattern={:?} text={:?}",
            pattern,
            text
        );
    }
}

#[test]
fn test_disabled_rules_keep_relative_order() {
    let rules = vec![
        Rule::new("a", "a", 1, Duration::from_secs(1)),
        Rule::new("b", "b", 1, Duration::from_secs(1)).with_enabled(false),
        Rule::new("c", "c", 1, Duration::from_secs(1)),
        Rule::new("d", "d", 1, Duration::from_secs(1)),
    ];
    let matcher = RuleMatcher::new(rules).unwrap();

    let names: Vec<_> = matcher.rules().map(|r| r.name.clone()).collect();
    assert_eq!(names, vec!["a", "c", "d"]);
    assert!(matcher.get("b").is_none());
}

#[test]
fn test_duplicate_names_rejected_even_when_disabled() {
    let rules = vec![
        Rule::new("a", "a", 1, Duration::from_secs(1)),
        Rule::new("a", "other", 1, Duration::from_secs(1)).with_enabled(false),
    ];
    assert!(matches!(
        RuleMatcher::new(rules),
        Err(QuotaGuardError::ConfigError(_))
    ));
}

#[test]
fn test_discovery_requires_substitution() {
    let rules = vec![
        Rule::new("Global", "global", 1000, Duration::from_secs(1)),
        Rule::new("Tenant", "tenant:${tenant_id}", 10, Duration::from_secs(1)),
        Rule::new("Region", "region:${region}", 10, Duration::from_secs(1)),
        Rule::new(
            "Api",
            "api:${tenant_id}:${method}:${path}",
            10,
            Duration::from_secs(1),
        ),
    ];
    let matcher = RuleMatcher::new(rules).unwrap();

    let names = |key: &QuotaKey| -> Vec<String> {
        matcher
            .matching_rules(key)
            .iter()
            .map(|r| r.name.clone())
            .collect()
    };

    assert_eq!(names(&QuotaKey::new()), vec!["Global"]);
    assert_eq!(names(&tenant("acme")), vec!["Global", "Tenant", "Api"]);
    assert_eq!(
        names(&QuotaKey::new().with_extra("region", "eu")),
        vec!["Global", "Region"]
    );
}
