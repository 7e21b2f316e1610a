//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和辅助结构。

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use quotaguard::{
    config::{EngineConfig, Rule},
    decision::{EffectiveLimit, QuotaInfo, QuotaResult},
    error::StorageError,
    key::QuotaKey,
    storage::DistributedStore,
    telemetry::QuotaObserver,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 模拟的分布式配额存储
///
/// 每个键按 burst 计数，不随时间补充；支持注入故障和延迟。
pub struct MockDistributedStore {
    used: DashMap<String, u64>,
    failure: Mutex<Option<StorageError>>,
    latency: Mutex<Duration>,
    checks: AtomicUsize,
    closed: AtomicBool,
}

impl MockDistributedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            used: DashMap::new(),
            failure: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            checks: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// 之后的所有调用都返回该错误
    pub fn fail_with(&self, error: StorageError) {
        *self.failure.lock() = Some(error);
    }

    /// 模拟连接被拒绝
    pub fn go_down(&self) {
        self.fail_with(StorageError::ConnectionError(
            "connection refused".to_string(),
        ));
    }

    /// 恢复正常
    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn used(&self, key: &str) -> u64 {
        self.used.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn step(&self) -> Result<(), StorageError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failure = self.failure.lock().clone();
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DistributedStore for MockDistributedStore {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: &EffectiveLimit,
        n: u64,
    ) -> Result<QuotaResult, StorageError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.step().await?;

        let mut used = self.used.entry(key.to_string()).or_insert(0);
        if *used + n <= limit.burst {
            *used += n;
            Ok(QuotaResult::allowed(
                limit.limit,
                limit.burst - *used,
                limit.window,
            ))
        } else {
            Ok(QuotaResult::denied(
                limit.limit,
                limit.burst.saturating_sub(*used),
                limit.window,
                limit.window,
            ))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        self.step().await?;
        self.used.remove(key);
        Ok(())
    }

    async fn query(&self, key: &str, limit: &EffectiveLimit) -> Result<QuotaInfo, StorageError> {
        self.step().await?;
        let used = self.used(key);
        Ok(QuotaInfo::new(
            limit.limit,
            limit.burst.saturating_sub(used),
            limit.window,
        ))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn type_name(&self) -> &str {
        "mock"
    }
}

/// 记录所有指标调用的观察者
#[derive(Default)]
pub struct CountingObserver {
    pub admissions: Mutex<Vec<(String, String, bool)>>,
    pub fallbacks: Mutex<Vec<(String, String)>>,
}

impl CountingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn admitted(&self) -> usize {
        self.admissions.lock().iter().filter(|(_, _, a)| *a).count()
    }

    pub fn denied(&self) -> usize {
        self.admissions.lock().iter().filter(|(_, _, a)| !*a).count()
    }

    pub fn rules(&self) -> Vec<String> {
        self.admissions
            .lock()
            .iter()
            .map(|(_, rule, _)| rule.clone())
            .collect()
    }
}

impl QuotaObserver for CountingObserver {
    fn record_admission(&self, backend: &str, rule: &str, admitted: bool, _latency: Duration) {
        self.admissions
            .lock()
            .push((backend.to_string(), rule.to_string(), admitted));
    }

    fn record_fallback(&self, strategy: &str, reason: &str) {
        self.fallbacks
            .lock()
            .push((strategy.to_string(), reason.to_string()));
    }
}

/// Global(100) → Tenant(5) 两层规则
pub fn layered_rules() -> Vec<Rule> {
    vec![
        Rule::new("Global", "global", 100, Duration::from_secs(60)),
        Rule::new("Tenant", "tenant:${tenant_id}", 5, Duration::from_secs(60)),
    ]
}

/// 使用给定规则的默认配置
pub fn config_with(rules: Vec<Rule>) -> EngineConfig {
    EngineConfig::builder()
        .key_prefix("test:")
        .rules(rules)
        .build()
        .expect("valid test config")
}

pub fn tenant(id: &str) -> QuotaKey {
    QuotaKey::new().with_tenant(id)
}

/// 安装测试日志（多次调用无副作用）
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("quotaguard=debug"))
        .with_test_writer()
        .try_init();
}
