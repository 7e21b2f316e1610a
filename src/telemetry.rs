//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 监控回调与指标
//!
//! 评估核心只通过窄接口输出副作用：
//!
//! - [`QuotaObserver`]: 指标接收端（准入计数/延迟、降级事件）
//! - [`Hooks`]: 观察者加上可选的用户回调 `on_admit` / `on_deny` / `on_fallback`
//! - [`PrometheusObserver`]: 基于 Prometheus 的观察者实现（需要 `monitoring` feature）
//!
//! # 示例
//!
//! ```rust
//! use quotaguard::telemetry::Hooks;
//!
//! let hooks = Hooks::new()
//!     .on_deny(|key, result| {
//!         tracing::info!("拒绝 {} (rule={})", key, result.rule);
//!     });
//! assert!(hooks.has_callbacks());
//! ```

use crate::decision::QuotaResult;
use crate::error::QuotaGuardError;
use crate::key::QuotaKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "monitoring")]
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "monitoring")]
use tracing::error;

/// 指标接收端
pub trait QuotaObserver: Send + Sync {
    /// 记录一次准入判定
    ///
    /// 出错的评估以 [`crate::constants::ERROR_RULE_LABEL`] 作为规则标签记录。
    fn record_admission(&self, backend: &str, rule: &str, admitted: bool, latency: Duration);

    /// 记录一次降级
    fn record_fallback(&self, strategy: &str, reason: &str);
}

/// 不记录任何指标的观察者
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl QuotaObserver for NoopObserver {
    fn record_admission(&self, _backend: &str, _rule: &str, _admitted: bool, _latency: Duration) {}

    fn record_fallback(&self, _strategy: &str, _reason: &str) {}
}

/// 判定回调
pub type DecisionCallback = Arc<dyn Fn(&QuotaKey, &QuotaResult) + Send + Sync>;

/// 降级回调
pub type FallbackCallback = Arc<dyn Fn(&QuotaKey, &QuotaGuardError) + Send + Sync>;

/// 观察者与用户回调
#[derive(Clone)]
pub struct Hooks {
    observer: Arc<dyn QuotaObserver>,
    on_admit: Option<DecisionCallback>,
    on_deny: Option<DecisionCallback>,
    on_fallback: Option<FallbackCallback>,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            observer: Arc::new(NoopObserver),
            on_admit: None,
            on_deny: None,
            on_fallback: None,
        }
    }

    /// 设置指标观察者
    pub fn with_observer(mut self, observer: Arc<dyn QuotaObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// 放行回调
    pub fn on_admit<F>(mut self, f: F) -> Self
    where
        F: Fn(&QuotaKey, &QuotaResult) + Send + Sync + 'static,
    {
        self.on_admit = Some(Arc::new(f));
        self
    }

    /// 拒绝回调
    pub fn on_deny<F>(mut self, f: F) -> Self
    where
        F: Fn(&QuotaKey, &QuotaResult) + Send + Sync + 'static,
    {
        self.on_deny = Some(Arc::new(f));
        self
    }

    /// 降级回调
    pub fn on_fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(&QuotaKey, &QuotaGuardError) + Send + Sync + 'static,
    {
        self.on_fallback = Some(Arc::new(f));
        self
    }

    pub fn observer(&self) -> &Arc<dyn QuotaObserver> {
        &self.observer
    }

    /// 是否注册了任何用户回调
    pub fn has_callbacks(&self) -> bool {
        self.on_admit.is_some() || self.on_deny.is_some() || self.on_fallback.is_some()
    }

    pub(crate) fn notify_decision(&self, key: &QuotaKey, result: &QuotaResult) {
        let callback = if result.allowed {
            &self.on_admit
        } else {
            &self.on_deny
        };
        if let Some(callback) = callback {
            callback(key, result);
        }
    }

    pub(crate) fn notify_fallback(&self, key: &QuotaKey, error: &QuotaGuardError) {
        if let Some(callback) = &self.on_fallback {
            callback(key, error);
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_admit", &self.on_admit.is_some())
            .field("on_deny", &self.on_deny.is_some())
            .field("on_fallback", &self.on_fallback.is_some())
            .finish()
    }
}

// ============================================================================
// Prometheus 观察者
// ============================================================================

/// Prometheus 指标观察者
///
/// 指标：
/// - `quotaguard_admissions_total{backend, rule, outcome}`
/// - `quotaguard_evaluation_duration_seconds{backend, rule}`
/// - `quotaguard_fallbacks_total{strategy, reason}`
#[cfg(feature = "monitoring")]
#[derive(Clone)]
pub struct PrometheusObserver {
    admissions: IntCounterVec,
    latency: HistogramVec,
    fallbacks: IntCounterVec,
    registry: Registry,
}

#[cfg(feature = "monitoring")]
impl PrometheusObserver {
    /// 创建观察者并在私有注册表中注册所有指标
    pub fn new() -> Result<Self, QuotaGuardError> {
        Self::with_registry(Registry::new())
    }

    /// 在给定注册表中注册所有指标
    pub fn with_registry(registry: Registry) -> Result<Self, QuotaGuardError> {
        let admissions = IntCounterVec::new(
            Opts::new(
                "quotaguard_admissions_total",
                "Total number of admission decisions",
            ),
            &["backend", "rule", "outcome"],
        )
        .map_err(metrics_error)?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                "quotaguard_evaluation_duration_seconds",
                "Latency of admission evaluations",
            )
            .buckets(vec![
                0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.05, 0.1, 0.5,
            ]),
            &["backend", "rule"],
        )
        .map_err(metrics_error)?;

        let fallbacks = IntCounterVec::new(
            Opts::new(
                "quotaguard_fallbacks_total",
                "Total number of fallbacks taken after the distributed store failed",
            ),
            &["strategy", "reason"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(admissions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(latency.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(fallbacks.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            admissions,
            latency,
            fallbacks,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 收集所有指标并返回Prometheus格式的文本
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("指标编码失败: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(feature = "monitoring")]
fn metrics_error(e: prometheus::Error) -> QuotaGuardError {
    QuotaGuardError::ConfigError(format!("指标注册失败: {}", e))
}

#[cfg(feature = "monitoring")]
impl QuotaObserver for PrometheusObserver {
    fn record_admission(&self, backend: &str, rule: &str, admitted: bool, latency: Duration) {
        let outcome = if admitted { "admitted" } else { "denied" };
        self.admissions
            .with_label_values(&[backend, rule, outcome])
            .inc();
        self.latency
            .with_label_values(&[backend, rule])
            .observe(latency.as_secs_f64());
    }

    fn record_fallback(&self, strategy: &str, reason: &str) {
        self.fallbacks.with_label_values(&[strategy, reason]).inc();
    }
}
