//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 规则匹配器模块
//!
//! 将启用的规则编译为按名称索引的表和保持声明顺序的名称列表，
//! 并为渲染后的键解析生效限额。
//!
//! # 覆盖项优先级
//!
//! 覆盖项按**声明顺序**线性扫描，**第一个**命中的模式生效，
//! 不做"最具体模式优先"的判断。例如：
//!
//! ```text
//! overrides: [("tenant:vip-*", 500), ("tenant:vip-corp", 1000)]
//! key:       tenant:vip-corp  ->  limit 500
//! ```
//!
//! 想让更具体的模式生效，必须把它声明在更宽泛的模式之前。

use crate::config::{Override, Rule};
use crate::decision::EffectiveLimit;
use crate::error::QuotaGuardError;
use crate::key::{has_placeholders, QuotaKey};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 通配符匹配
///
/// `*` 匹配零个或多个任意字符，其余字符按字面匹配，且必须匹配整个文本。
/// 使用 O(模式长度 × 文本长度) 的动态规划，仅保留两行，内存为 O(文本长度)。
///
/// # 示例
/// ```rust
/// use quotaguard::matchers::wildcard_match;
///
/// assert!(wildcard_match("tenant:vip-*", "tenant:vip-corp"));
/// assert!(wildcard_match("*:orders", "acme:orders"));
/// assert!(!wildcard_match("tenant:vip-*", "tenant:basic"));
/// ```
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    let p = pattern.as_bytes();
    let t = text.as_bytes();

    let mut prev = vec![false; t.len() + 1];
    let mut cur = vec![false; t.len() + 1];
    prev[0] = true;

    for &pc in p {
        cur[0] = prev[0] && pc == b'*';
        for j in 1..=t.len() {
            cur[j] = if pc == b'*' {
                prev[j] || cur[j - 1]
            } else {
                prev[j - 1] && pc == t[j - 1]
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    prev[t.len()]
}

/// 匹配器统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatcherStats {
    /// 命中覆盖项的解析次数
    pub override_hits: u64,
    /// 使用规则默认值的解析次数
    pub default_hits: u64,
}

/// 规则匹配器
///
/// 构造后不可变；重新配置时整体替换。
#[derive(Debug)]
pub struct RuleMatcher {
    /// 按名称索引的启用规则
    rules: HashMap<String, Arc<Rule>>,
    /// 启用规则的名称（声明顺序）
    order: Vec<String>,
    override_hits: AtomicU64,
    default_hits: AtomicU64,
}

impl RuleMatcher {
    /// 编译规则集
    ///
    /// 规则先整体校验（名称唯一、字段合法），禁用的规则随后被排除，
    /// 启用规则之间保持原有的声明顺序。
    pub fn new(rules: Vec<Rule>) -> Result<Self, QuotaGuardError> {
        let mut names = HashSet::new();
        for rule in &rules {
            if !names.insert(rule.name.clone()) {
                return Err(QuotaGuardError::ConfigError(format!(
                    "规则名重复: {}",
                    rule.name
                )));
            }
            rule.validate().map_err(QuotaGuardError::ConfigError)?;
        }

        let mut by_name = HashMap::new();
        let mut order = Vec::new();
        for rule in rules.into_iter().filter(|r| r.enabled) {
            order.push(rule.name.clone());
            by_name.insert(rule.name.clone(), Arc::new(rule));
        }

        Ok(Self {
            rules: by_name,
            order,
            override_hits: AtomicU64::new(0),
            default_hits: AtomicU64::new(0),
        })
    }

    /// 空匹配器
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            order: Vec::new(),
            override_hits: AtomicU64::new(0),
            default_hits: AtomicU64::new(0),
        }
    }

    /// 按声明顺序遍历启用的规则
    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> + '_ {
        self.order.iter().filter_map(|name| self.rules.get(name))
    }

    /// 按名称获取规则
    pub fn get(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.get(name)
    }

    /// 启用规则数量
    pub fn rule_count(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 返回第一个匹配渲染键的覆盖项
    pub fn matched_override<'a>(&self, rule: &'a Rule, rendered: &str) -> Option<&'a Override> {
        rule.overrides
            .iter()
            .find(|o| wildcard_match(&o.pattern, rendered))
    }

    /// 解析规则在给定渲染键上的生效限额
    ///
    /// 覆盖项未设置窗口或突发值（或设为 0）时沿用规则的值。
    pub fn resolve(&self, rule: &Rule, rendered: &str) -> EffectiveLimit {
        match self.matched_override(rule, rendered) {
            Some(o) => {
                self.override_hits.fetch_add(1, Ordering::Relaxed);
                let window = o
                    .window
                    .filter(|w| !w.is_zero())
                    .unwrap_or(rule.window);
                let burst = o.burst.filter(|b| *b > 0).unwrap_or(rule.burst);
                EffectiveLimit::new(o.limit, burst, window)
            }
            None => {
                self.default_hits.fetch_add(1, Ordering::Relaxed);
                EffectiveLimit::new(rule.limit, rule.burst, rule.window)
            }
        }
    }

    /// 找出适用于请求标识的规则（用于发现，不在评估热路径上使用）
    ///
    /// 不含占位符的规则总是适用；含占位符的规则只有在渲染时
    /// 至少替换了一个字段才视为适用。
    pub fn matching_rules(&self, key: &QuotaKey) -> Vec<Arc<Rule>> {
        self.rules()
            .filter(|rule| {
                if !has_placeholders(&rule.key_template) {
                    return true;
                }
                let (rendered, substituted) = key.render_counted(&rule.key_template);
                substituted > 0 && !rendered.is_empty()
            })
            .cloned()
            .collect()
    }

    /// 获取统计信息
    pub fn stats(&self) -> MatcherStats {
        MatcherStats {
            override_hits: self.override_hits.load(Ordering::Relaxed),
            default_hits: self.default_hits.load(Ordering::Relaxed),
        }
    }

    /// 重置统计信息
    pub fn reset_stats(&self) {
        self.override_hits.store(0, Ordering::Relaxed);
        self.default_hits.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// 单元测试
// ============================================================================
