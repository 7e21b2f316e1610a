//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Governor 评估核心
//!
//! 对一个请求标识按声明顺序逐条应用启用的规则：
//!
//! 1. 渲染键模板，解析生效限额（覆盖项按声明顺序第一个匹配者生效）
//! 2. 调用后端检查并消耗配额
//! 3. 第一条拒绝的规则立即短路返回
//! 4. 全部放行时返回剩余配额最少的结果
//!
//! 多规则评估不是跨规则原子的：前面放行的规则已经消耗的配额，
//! 不会因为后面的规则拒绝而归还。

use crate::config::{EngineConfig, Rule};
use crate::constants::ERROR_RULE_LABEL;
use crate::decision::{QuotaInfo, QuotaResult};
use crate::error::QuotaGuardError;
use crate::key::QuotaKey;
use crate::limiters::{LocalBackend, ReplicaCountProvider, StaticReplicaCount};
use crate::matchers::RuleMatcher;
use crate::storage::QuotaBackend;
use crate::telemetry::Hooks;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument, Span};

/// 评估核心
pub struct Governor {
    key_prefix: String,
    /// 规则匹配器（整体替换）
    matcher: RwLock<Arc<RuleMatcher>>,
    backend: Arc<dyn QuotaBackend>,
    hooks: Hooks,
    enable_metrics: bool,
    enable_tracing: bool,
    enable_headers: bool,
    closed: AtomicBool,
}

impl Governor {
    /// 创建评估核心
    ///
    /// 配置在此处校验一次，非法配置不会进入请求路径。
    pub fn new(
        config: &EngineConfig,
        backend: Arc<dyn QuotaBackend>,
        hooks: Hooks,
    ) -> Result<Self, QuotaGuardError> {
        config.validate().map_err(QuotaGuardError::ConfigError)?;
        let matcher = RuleMatcher::new(config.rules.clone())?;

        info!(
            "创建 Governor: backend={}, rules={}, prefix={:?}",
            backend.backend_type(),
            matcher.rule_count(),
            config.key_prefix
        );

        Ok(Self {
            key_prefix: config.key_prefix.clone(),
            matcher: RwLock::new(Arc::new(matcher)),
            backend,
            hooks,
            enable_metrics: config.enable_metrics,
            enable_tracing: config.enable_tracing,
            enable_headers: config.enable_headers,
            closed: AtomicBool::new(false),
        })
    }

    /// 基于本地令牌桶后端创建评估核心
    ///
    /// 后端的键数量上限与副本数取自配置。
    pub fn local(config: &EngineConfig) -> Result<Self, QuotaGuardError> {
        Self::local_with(
            config,
            Arc::new(StaticReplicaCount(config.effective_replicas())),
            Hooks::default(),
        )
    }

    /// 基于本地令牌桶后端创建评估核心，指定副本数提供者与回调
    pub fn local_with(
        config: &EngineConfig,
        replicas: Arc<dyn ReplicaCountProvider>,
        hooks: Hooks,
    ) -> Result<Self, QuotaGuardError> {
        let backend = LocalBackend::with_replicas(config.max_local_keys, replicas);
        Self::new(config, Arc::new(backend), hooks)
    }

    /// 评估一个请求（消耗 1 个令牌）
    pub async fn evaluate(&self, key: &QuotaKey) -> Result<QuotaResult, QuotaGuardError> {
        self.evaluate_n(key, 1).await
    }

    /// 评估一个请求，消耗 `n` 个令牌
    ///
    /// # 返回
    /// - `Ok(result)`: 判定结果；`result.allowed == false` 表示被限流
    /// - `Err(InvalidArgument)`: `n` 为 0
    /// - `Err(Closed)`: 已关闭
    /// - `Err(_)`: 后端错误（原样传播）
    pub async fn evaluate_n(&self, key: &QuotaKey, n: u64) -> Result<QuotaResult, QuotaGuardError> {
        self.ensure_open()?;
        validate_cost(n)?;

        let span = if self.enable_tracing {
            tracing::info_span!(
                "quota_evaluate",
                backend = %self.backend.backend_type(),
                tenant = %key.tenant_id,
                caller = %key.caller_id,
                n = n
            )
        } else {
            Span::none()
        };

        let start = Instant::now();
        let outcome = self.evaluate_rules(key, n).instrument(span).await;
        self.observe(key, &outcome, start.elapsed());
        outcome
    }

    async fn evaluate_rules(&self, key: &QuotaKey, n: u64) -> Result<QuotaResult, QuotaGuardError> {
        let matcher = self.matcher();
        let mut tightest: Option<QuotaResult> = None;

        for rule in matcher.rules() {
            let rendered = key.render(&rule.key_template);
            let limit = matcher.resolve(rule, &rendered);
            let storage_key = self.storage_key(rule, &rendered);

            let result = self
                .backend
                .check(&storage_key, &limit, n)
                .await?
                .with_origin(rule.name.as_str(), rendered);

            if !result.allowed {
                return Ok(result);
            }

            match &tightest {
                Some(current) if current.remaining <= result.remaining => {}
                _ => tightest = Some(result),
            }
        }

        Ok(tightest.unwrap_or_else(QuotaResult::unmatched))
    }

    fn observe(
        &self,
        key: &QuotaKey,
        outcome: &Result<QuotaResult, QuotaGuardError>,
        latency: Duration,
    ) {
        let backend = self.backend.backend_type();

        match outcome {
            Ok(result) => {
                if self.enable_metrics {
                    self.hooks
                        .observer()
                        .record_admission(backend, &result.rule, result.allowed, latency);
                }

                if result.allowed {
                    debug!(
                        "放行: key={}, rule={}, remaining={}/{}",
                        result.key, result.rule, result.remaining, result.limit
                    );
                } else {
                    info!(
                        "拒绝: key={}, rule={}, retry_after={:?}",
                        result.key, result.rule, result.retry_after
                    );
                }

                self.hooks.notify_decision(key, result);
            }
            Err(e) => {
                if self.enable_metrics {
                    self.hooks
                        .observer()
                        .record_admission(backend, ERROR_RULE_LABEL, false, latency);
                }

                if e.is_unavailable() {
                    debug!("后端不可达: backend={}, error={}", backend, e);
                } else {
                    warn!("评估失败: backend={}, {}, error={}", backend, key, e);
                }
            }
        }
    }

    /// 清除请求标识在所有启用规则下的配额状态
    ///
    /// 后端不支持重置时返回 `NotSupported`。
    pub async fn reset(&self, key: &QuotaKey) -> Result<(), QuotaGuardError> {
        self.ensure_open()?;
        let resettable = self.backend.as_resettable().ok_or_else(|| {
            QuotaGuardError::NotSupported(format!(
                "后端 {} 不支持重置",
                self.backend.backend_type()
            ))
        })?;

        let matcher = self.matcher();
        let mut errors = Vec::new();
        for rule in matcher.rules() {
            let storage_key = self.storage_key(rule, &key.render(&rule.key_template));
            match resettable.reset(&storage_key).await {
                Ok(()) => {}
                // 后端不可达时其余规则同样失败
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => errors.push(e),
            }
        }

        match QuotaGuardError::join(errors) {
            Some(e) => Err(e),
            None => {
                debug!("已重置配额: {}", key);
                Ok(())
            }
        }
    }

    /// 查询请求标识的配额快照，不消耗配额
    ///
    /// 返回所有启用规则中剩余配额最少的快照；后端不支持查询时返回 `NotSupported`。
    pub async fn query(&self, key: &QuotaKey) -> Result<QuotaInfo, QuotaGuardError> {
        self.ensure_open()?;
        let queryable = self.backend.as_queryable().ok_or_else(|| {
            QuotaGuardError::NotSupported(format!(
                "后端 {} 不支持查询",
                self.backend.backend_type()
            ))
        })?;

        let matcher = self.matcher();
        let mut tightest: Option<QuotaInfo> = None;
        for rule in matcher.rules() {
            let rendered = key.render(&rule.key_template);
            let limit = matcher.resolve(rule, &rendered);
            let mut info = queryable
                .query(&self.storage_key(rule, &rendered), &limit)
                .await?;
            info.rule = rule.name.clone();
            info.key = rendered;

            match &tightest {
                Some(current) if current.remaining <= info.remaining => {}
                _ => tightest = Some(info),
            }
        }

        Ok(tightest.unwrap_or_else(|| QuotaInfo::new(0, 0, Duration::ZERO)))
    }

    /// 关闭
    ///
    /// 第一次调用关闭后端；之后的调用返回 `AlreadyClosed`。
    /// 进行中的评估不会被中断。
    pub async fn close(&self) -> Result<(), QuotaGuardError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(QuotaGuardError::AlreadyClosed);
        }
        info!("关闭 Governor: backend={}", self.backend.backend_type());
        self.backend.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 替换规则集
    ///
    /// 新规则集编译成功后整体替换匹配器；编译失败时保持原规则集不变。
    pub fn update_rules(&self, rules: Vec<Rule>) -> Result<(), QuotaGuardError> {
        self.ensure_open()?;
        let matcher = RuleMatcher::new(rules)?;
        self.replace_matcher(Arc::new(matcher));
        Ok(())
    }

    /// 用已编译的匹配器整体替换规则集
    pub fn replace_matcher(&self, matcher: Arc<RuleMatcher>) {
        info!("更新规则集: rules={}", matcher.rule_count());
        *self.matcher.write() = matcher;
    }

    /// 适用于请求标识的规则
    pub fn matching_rules(&self, key: &QuotaKey) -> Vec<Arc<Rule>> {
        self.matcher().matching_rules(key)
    }

    /// 当前规则匹配器快照
    pub fn matcher(&self) -> Arc<RuleMatcher> {
        self.matcher.read().clone()
    }

    /// 判定结果对应的响应头；关闭响应头时返回空列表
    pub fn response_headers(&self, result: &QuotaResult) -> Vec<(&'static str, String)> {
        if self.enable_headers {
            result.headers()
        } else {
            Vec::new()
        }
    }

    pub fn backend(&self) -> &Arc<dyn QuotaBackend> {
        &self.backend
    }

    pub fn backend_type(&self) -> &str {
        self.backend.backend_type()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn metrics_enabled(&self) -> bool {
        self.enable_metrics
    }

    /// 存储键：`{prefix}{rule}:{rendered}`
    fn storage_key(&self, rule: &Rule, rendered: &str) -> String {
        let mut key =
            String::with_capacity(self.key_prefix.len() + rule.name.len() + rendered.len() + 1);
        key.push_str(&self.key_prefix);
        key.push_str(&rule.name);
        key.push(':');
        key.push_str(rendered);
        key
    }

    fn ensure_open(&self) -> Result<(), QuotaGuardError> {
        if self.is_closed() {
            Err(QuotaGuardError::Closed)
        } else {
            Ok(())
        }
    }
}

/// 校验请求的令牌数
fn validate_cost(n: u64) -> Result<(), QuotaGuardError> {
    if n == 0 {
        return Err(QuotaGuardError::InvalidArgument(
            "请求的令牌数必须大于0".to_string(),
        ));
    }
    Ok(())
}
