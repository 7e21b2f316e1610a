//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 降级编排
//!
//! [`FallbackGovernor`] 组合一个基于分布式后端的评估核心和一个基于本地令牌桶的评估核心。
//! 分布式调用成功时原样返回其结果；失败时先分类：
//!
//! - 存储不可达（连接、超时、网络类错误或显式的不可用标记）：记录降级事件后按策略处理
//! - 其他错误：原样传播，不降级
//!
//! # 策略
//!
//! | 模式          | 行为                                                         |
//! |---------------|--------------------------------------------------------------|
//! | `Local`       | 交给本地评估核心                                              |
//! | `FailOpen`    | 放行，规则名为 `fallback-open`                                |
//! | `FailClosed`  | 返回 `UnavailableDenied`，附带规则名为 `fallback-close` 的拒绝结果 |
//! | `Custom`      | 调用用户提供的函数                                            |

use crate::config::{CustomFallback, EngineConfig, FallbackMode, Rule};
use crate::constants::{FALLBACK_CLOSE_RETRY_AFTER, FALLBACK_CLOSE_RULE, FALLBACK_OPEN_RULE};
use crate::decision::{QuotaInfo, QuotaResult};
use crate::error::QuotaGuardError;
use crate::governor::Governor;
use crate::key::QuotaKey;
use crate::limiters::{ReplicaCountProvider, StaticReplicaCount};
use crate::matchers::RuleMatcher;
use crate::storage::{DistributedBackend, DistributedStore, QuotaBackend};
use crate::telemetry::Hooks;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 已解析的降级策略
#[derive(Debug, Clone)]
enum Strategy {
    Local,
    FailOpen,
    FailClosed,
    Custom(CustomFallback),
}

impl Strategy {
    fn from_config(config: &EngineConfig) -> Result<Self, QuotaGuardError> {
        Ok(match config.fallback {
            FallbackMode::Local => Strategy::Local,
            FallbackMode::FailOpen => Strategy::FailOpen,
            FallbackMode::FailClosed => Strategy::FailClosed,
            FallbackMode::Custom => match &config.custom_fallback {
                Some(f) => Strategy::Custom(f.clone()),
                None => {
                    return Err(QuotaGuardError::ConfigError(
                        "custom 降级模式需要提供降级函数".to_string(),
                    ))
                }
            },
        })
    }

    fn mode(&self) -> FallbackMode {
        match self {
            Strategy::Local => FallbackMode::Local,
            Strategy::FailOpen => FallbackMode::FailOpen,
            Strategy::FailClosed => FallbackMode::FailClosed,
            Strategy::Custom(_) => FallbackMode::Custom,
        }
    }
}

/// 带降级的评估器
pub struct FallbackGovernor {
    primary: Governor,
    local: Governor,
    strategy: Strategy,
    hooks: Hooks,
    enable_metrics: bool,
    fallbacks: AtomicU64,
    closed: AtomicBool,
}

impl FallbackGovernor {
    /// 基于分布式存储创建
    ///
    /// 分布式调用使用配置中的 `backend_timeout`；本地后端的键数量上限和副本数取自配置。
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn DistributedStore>,
        hooks: Hooks,
    ) -> Result<Self, QuotaGuardError> {
        Self::with_replicas(
            config,
            store,
            Arc::new(StaticReplicaCount(config.effective_replicas())),
            hooks,
        )
    }

    /// 基于分布式存储创建，本地后端使用给定的副本数提供者
    pub fn with_replicas(
        config: &EngineConfig,
        store: Arc<dyn DistributedStore>,
        replicas: Arc<dyn ReplicaCountProvider>,
        hooks: Hooks,
    ) -> Result<Self, QuotaGuardError> {
        let distributed = DistributedBackend::new(store, config.backend_timeout);
        let primary = Governor::new(config, Arc::new(distributed), hooks.clone())?;
        let local = Governor::local_with(config, replicas, hooks.clone())?;
        Self::assemble(config, primary, local, hooks)
    }

    /// 使用任意两个后端创建
    pub fn with_backends(
        config: &EngineConfig,
        primary: Arc<dyn QuotaBackend>,
        local: Arc<dyn QuotaBackend>,
        hooks: Hooks,
    ) -> Result<Self, QuotaGuardError> {
        let primary = Governor::new(config, primary, hooks.clone())?;
        let local = Governor::new(config, local, hooks.clone())?;
        Self::assemble(config, primary, local, hooks)
    }

    fn assemble(
        config: &EngineConfig,
        primary: Governor,
        local: Governor,
        hooks: Hooks,
    ) -> Result<Self, QuotaGuardError> {
        let strategy = Strategy::from_config(config)?;
        info!(
            "创建降级评估器: primary={}, local={}, strategy={}",
            primary.backend_type(),
            local.backend_type(),
            strategy.mode().as_str()
        );

        Ok(Self {
            primary,
            local,
            strategy,
            hooks,
            enable_metrics: config.enable_metrics,
            fallbacks: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// 评估一个请求（消耗 1 个令牌）
    pub async fn evaluate(&self, key: &QuotaKey) -> Result<QuotaResult, QuotaGuardError> {
        self.evaluate_n(key, 1).await
    }

    /// 评估一个请求，消耗 `n` 个令牌
    ///
    /// 分布式存储不可达时按策略降级；只有 `FailClosed` 会让不可达错误
    /// 以 `UnavailableDenied` 的形式返回给调用方。
    pub async fn evaluate_n(&self, key: &QuotaKey, n: u64) -> Result<QuotaResult, QuotaGuardError> {
        self.ensure_open()?;

        match self.primary.evaluate_n(key, n).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_unavailable() => self.degrade(key, n, e).await,
            Err(e) => Err(e),
        }
    }

    async fn degrade(
        &self,
        key: &QuotaKey,
        n: u64,
        error: QuotaGuardError,
    ) -> Result<QuotaResult, QuotaGuardError> {
        let mode = self.strategy.mode();
        let reason = error.unavailable_reason();

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        warn!(
            "分布式存储不可达，执行降级: strategy={}, reason={}, {}, error={}",
            mode.as_str(),
            reason,
            key,
            error
        );
        if self.enable_metrics {
            self.hooks.observer().record_fallback(mode.as_str(), reason);
        }
        self.hooks.notify_fallback(key, &error);

        match &self.strategy {
            Strategy::Local => self.local.evaluate_n(key, n).await,
            Strategy::FailOpen => {
                let result = QuotaResult::allowed(0, 0, Duration::ZERO)
                    .with_origin(FALLBACK_OPEN_RULE, key.to_string());
                self.hooks.notify_decision(key, &result);
                Ok(result)
            }
            Strategy::FailClosed => {
                let result = QuotaResult::denied(
                    0,
                    0,
                    FALLBACK_CLOSE_RETRY_AFTER,
                    FALLBACK_CLOSE_RETRY_AFTER,
                )
                .with_origin(FALLBACK_CLOSE_RULE, key.to_string());
                self.hooks.notify_decision(key, &result);
                Err(QuotaGuardError::UnavailableDenied {
                    result: Box::new(result),
                    reason: error.to_string(),
                })
            }
            Strategy::Custom(f) => {
                let outcome = f.call(key, n, &error);
                if let Ok(result) = &outcome {
                    self.hooks.notify_decision(key, result);
                }
                outcome
            }
        }
    }

    /// 同时重置两个后端
    ///
    /// 不可达错误只记录日志；其余错误合并后返回。
    pub async fn reset(&self, key: &QuotaKey) -> Result<(), QuotaGuardError> {
        self.ensure_open()?;

        let mut errors = Vec::new();
        for (side, governor) in [("primary", &self.primary), ("local", &self.local)] {
            match governor.reset(key).await {
                Ok(()) => {}
                Err(e) if e.is_unavailable() => {
                    warn!("重置时后端不可达: side={}, error={}", side, e);
                }
                Err(e) => errors.push(e),
            }
        }

        match QuotaGuardError::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 查询配额快照
    ///
    /// 优先查询分布式后端；不可达或不支持查询时改查本地后端。
    /// 两边都不支持时返回 `NotSupported`。
    pub async fn query(&self, key: &QuotaKey) -> Result<QuotaInfo, QuotaGuardError> {
        self.ensure_open()?;

        match self.primary.query(key).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_unavailable() => {
                debug!("查询时分布式后端不可达，改查本地: {}", e);
                self.local.query(key).await
            }
            Err(QuotaGuardError::NotSupported(_)) => self.local.query(key).await,
            Err(e) => Err(e),
        }
    }

    /// 关闭两个评估核心
    ///
    /// 第一次调用返回关闭过程中的错误（合并后）；之后的调用返回 `AlreadyClosed`。
    pub async fn close(&self) -> Result<(), QuotaGuardError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(QuotaGuardError::AlreadyClosed);
        }

        let mut errors = Vec::new();
        for governor in [&self.primary, &self.local] {
            match governor.close().await {
                Ok(()) | Err(QuotaGuardError::AlreadyClosed) => {}
                Err(e) => errors.push(e),
            }
        }

        info!(
            "降级评估器已关闭: fallbacks={}",
            self.fallbacks.load(Ordering::Relaxed)
        );
        match QuotaGuardError::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 同时替换两侧的规则集
    ///
    /// 规则集只编译一次；编译失败时两侧都保持不变。
    pub fn update_rules(&self, rules: Vec<Rule>) -> Result<(), QuotaGuardError> {
        self.ensure_open()?;
        let matcher = Arc::new(RuleMatcher::new(rules)?);
        self.primary.replace_matcher(Arc::clone(&matcher));
        self.local.replace_matcher(matcher);
        Ok(())
    }

    /// 适用于请求标识的规则
    pub fn matching_rules(&self, key: &QuotaKey) -> Vec<Arc<Rule>> {
        self.primary.matching_rules(key)
    }

    /// 判定结果对应的响应头
    pub fn response_headers(&self, result: &QuotaResult) -> Vec<(&'static str, String)> {
        self.primary.response_headers(result)
    }

    /// 当前降级模式
    pub fn mode(&self) -> FallbackMode {
        self.strategy.mode()
    }

    /// 累计降级次数
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn primary(&self) -> &Governor {
        &self.primary
    }

    pub fn local(&self) -> &Governor {
        &self.local
    }

    fn ensure_open(&self) -> Result<(), QuotaGuardError> {
        if self.is_closed() {
            Err(QuotaGuardError::Closed)
        } else {
            Ok(())
        }
    }
}
