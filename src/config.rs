//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配置模块
//!
//! 定义规则、覆盖项、降级策略与引擎配置。
//!
//! 配置只在构造阶段校验一次，非法组合在处理任何请求之前被拒绝。
//! 本模块只提供可序列化的结构体，不规定配置文件格式。

use crate::constants::{DEFAULT_MAX_LOCAL_KEYS, MAX_QUOTA};
use crate::decision::QuotaResult;
use crate::error::QuotaGuardError;
use crate::key::QuotaKey;
use ahash::AHashSet as HashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// 规则
// ============================================================================

fn default_enabled() -> bool {
    true
}

/// 覆盖项
///
/// 用通配符模式匹配渲染后的键，命中时替换规则的默认限额。
/// 未设置（或为 0）的窗口与突发值沿用所属规则的值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    /// 通配符模式，`*` 匹配零个或多个任意字符
    pub pattern: String,
    /// 限额
    pub limit: u64,
    /// 窗口
    #[serde(default, with = "humantime_serde")]
    pub window: Option<Duration>,
    /// 突发容量
    #[serde(default)]
    pub burst: Option<u64>,
}

impl Override {
    pub fn new(pattern: &str, limit: u64) -> Self {
        Self {
            pattern: pattern.to_string(),
            limit,
            window: None,
            burst: None,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// 校验覆盖项
    pub fn validate(&self) -> Result<(), String> {
        if self.pattern.is_empty() {
            return Err("覆盖项模式不能为空".to_string());
        }

        if self.limit == 0 {
            return Err(format!("覆盖项 '{}' 的限额必须大于0", self.pattern));
        }

        if self.limit > MAX_QUOTA || self.burst.is_some_and(|b| b > MAX_QUOTA) {
            return Err(format!(
                "覆盖项 '{}' 的限额或突发容量超过上限 {}",
                self.pattern, MAX_QUOTA
            ));
        }

        Ok(())
    }
}

/// 限流规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// 规则名（在规则集中唯一）
    pub name: String,
    /// 键模板，例如 `tenant:${tenant_id}`
    pub key_template: String,
    /// 窗口内允许的请求数
    pub limit: u64,
    /// 窗口长度
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// 突发容量，0 表示等于 limit
    #[serde(default)]
    pub burst: u64,
    /// 覆盖项（按声明顺序匹配，第一个命中者生效）
    #[serde(default)]
    pub overrides: Vec<Override>,
    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Rule {
    /// 创建新的规则
    ///
    /// # 示例
    /// ```rust
    /// use quotaguard::config::{Override, Rule};
    /// use std::time::Duration;
    ///
    /// let rule = Rule::new("tenant", "tenant:${tenant_id}", 100, Duration::from_secs(1))
    ///     .with_burst(150)
    ///     .with_override(Override::new("tenant:vip-*", 500));
    /// assert!(rule.validate().is_ok());
    /// ```
    pub fn new(name: &str, key_template: &str, limit: u64, window: Duration) -> Self {
        Self {
            name: name.to_string(),
            key_template: key_template.to_string(),
            limit,
            window,
            burst: 0,
            overrides: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_override(mut self, override_: Override) -> Self {
        self.overrides.push(override_);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 校验规则
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("规则名不能为空".to_string());
        }

        if self.key_template.is_empty() {
            return Err(format!("规则 '{}' 的键模板不能为空", self.name));
        }

        if self.limit == 0 {
            return Err(format!("规则 '{}' 的限额必须大于0", self.name));
        }

        if self.limit > MAX_QUOTA || self.burst > MAX_QUOTA {
            return Err(format!(
                "规则 '{}' 的限额或突发容量超过上限 {}",
                self.name, MAX_QUOTA
            ));
        }

        if self.window.is_zero() {
            return Err(format!("规则 '{}' 的窗口必须大于0", self.name));
        }

        for override_ in &self.overrides {
            override_
                .validate()
                .map_err(|e| format!("规则 '{}': {}", self.name, e))?;
        }

        Ok(())
    }
}

// ============================================================================
// 降级策略
// ============================================================================

/// 分布式存储不可达时的降级策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FallbackMode {
    /// 委托给本地令牌桶
    #[default]
    Local,
    /// 全部放行
    FailOpen,
    /// 全部拒绝
    FailClosed,
    /// 调用用户提供的函数
    Custom,
}

impl FallbackMode {
    /// 从名称解析；空值或无法识别的名称回落为 [`FallbackMode::Local`]
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "open" | "fail_open" | "fail-open" | "allow" => FallbackMode::FailOpen,
            "close" | "closed" | "fail_closed" | "fail-closed" | "deny" => {
                FallbackMode::FailClosed
            }
            "custom" => FallbackMode::Custom,
            _ => FallbackMode::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackMode::Local => "local",
            FallbackMode::FailOpen => "fail_open",
            FallbackMode::FailClosed => "fail_closed",
            FallbackMode::Custom => "custom",
        }
    }
}

impl From<String> for FallbackMode {
    fn from(name: String) -> Self {
        FallbackMode::parse(&name)
    }
}

impl From<FallbackMode> for String {
    fn from(mode: FallbackMode) -> Self {
        mode.as_str().to_string()
    }
}

/// 自定义降级函数
///
/// 参数依次为请求标识、请求的令牌数与原始错误。
#[derive(Clone)]
pub struct CustomFallback(
    Arc<dyn Fn(&QuotaKey, u64, &QuotaGuardError) -> Result<QuotaResult, QuotaGuardError> + Send + Sync>,
);

impl CustomFallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&QuotaKey, u64, &QuotaGuardError) -> Result<QuotaResult, QuotaGuardError>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(
        &self,
        key: &QuotaKey,
        n: u64,
        error: &QuotaGuardError,
    ) -> Result<QuotaResult, QuotaGuardError> {
        (self.0)(key, n, error)
    }
}

impl fmt::Debug for CustomFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomFallback(<fn>)")
    }
}

// ============================================================================
// 引擎配置
// ============================================================================

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 存储键前缀
    #[serde(default)]
    pub key_prefix: String,
    /// 规则（声明顺序即评估顺序）
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// 降级策略
    #[serde(default)]
    pub fallback: FallbackMode,
    /// 预期副本数，本地降级时按此值均分配额；0 视为 1
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// 本地后端可跟踪的最大键数量
    #[serde(default = "default_max_local_keys")]
    pub max_local_keys: usize,
    /// 单次分布式调用的超时
    #[serde(default, with = "humantime_serde")]
    pub backend_timeout: Option<Duration>,
    /// 是否记录指标
    #[serde(default = "default_enabled")]
    pub enable_metrics: bool,
    /// 是否为每次评估创建追踪span
    #[serde(default)]
    pub enable_tracing: bool,
    /// 是否生成限流响应头
    #[serde(default = "default_enabled")]
    pub enable_headers: bool,
    /// 自定义降级函数（仅 Custom 策略使用）
    #[serde(skip)]
    pub custom_fallback: Option<CustomFallback>,
}

fn default_replicas() -> u32 {
    1
}

fn default_max_local_keys() -> usize {
    DEFAULT_MAX_LOCAL_KEYS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            rules: Vec::new(),
            fallback: FallbackMode::Local,
            replicas: default_replicas(),
            max_local_keys: DEFAULT_MAX_LOCAL_KEYS,
            backend_timeout: None,
            enable_metrics: true,
            enable_tracing: false,
            enable_headers: true,
            custom_fallback: None,
        }
    }
}

impl EngineConfig {
    /// 创建配置构建器
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        for (index, rule) in self.rules.iter().enumerate() {
            if !names.insert(rule.name.as_str()) {
                return Err(format!("规则名重复: {}", rule.name));
            }

            rule.validate()
                .map_err(|e| format!("规则[{}]校验失败: {}", index, e))?;
        }

        if self.fallback == FallbackMode::Custom && self.custom_fallback.is_none() {
            return Err("降级策略为 custom 但未提供自定义降级函数".to_string());
        }

        if self.max_local_keys == 0 {
            return Err("本地最大键数量必须大于0".to_string());
        }

        if self.backend_timeout.is_some_and(|t| t.is_zero()) {
            return Err("后端超时必须大于0".to_string());
        }

        Ok(())
    }

    /// 有效副本数（至少为1）
    pub fn effective_replicas(&self) -> usize {
        self.replicas.max(1) as usize
    }
}

/// 引擎配置构建器
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.config.key_prefix = prefix.to_string();
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.config.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.config.rules.extend(rules);
        self
    }

    pub fn fallback(mut self, mode: FallbackMode) -> Self {
        self.config.fallback = mode;
        self
    }

    /// 按名称设置降级策略，无法识别的名称回落为 local
    pub fn fallback_name(mut self, name: &str) -> Self {
        self.config.fallback = FallbackMode::parse(name);
        self
    }

    /// 设置自定义降级函数，并将策略切换为 custom
    pub fn custom_fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(&QuotaKey, u64, &QuotaGuardError) -> Result<QuotaResult, QuotaGuardError>
            + Send
            + Sync
            + 'static,
    {
        self.config.fallback = FallbackMode::Custom;
        self.config.custom_fallback = Some(CustomFallback::new(f));
        self
    }

    pub fn replicas(mut self, replicas: u32) -> Self {
        self.config.replicas = replicas;
        self
    }

    pub fn max_local_keys(mut self, max: usize) -> Self {
        self.config.max_local_keys = max;
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend_timeout = Some(timeout);
        self
    }

    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.config.enable_metrics = enabled;
        self
    }

    pub fn enable_tracing(mut self, enabled: bool) -> Self {
        self.config.enable_tracing = enabled;
        self
    }

    pub fn enable_headers(mut self, enabled: bool) -> Self {
        self.config.enable_headers = enabled;
        self
    }

    /// 校验并生成配置
    pub fn build(self) -> Result<EngineConfig, QuotaGuardError> {
        self.config
            .validate()
            .map_err(QuotaGuardError::ConfigError)?;
        Ok(self.config)
    }
}
