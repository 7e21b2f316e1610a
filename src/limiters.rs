//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 本地令牌桶后端
//!
//! 每个渲染键拥有一个令牌桶（令牌数、补充速率、容量、上次补充时间），
//! 由桶自身的锁保护。键到桶的映射使用分片的 `DashMap`，不存在覆盖全部键的全局锁。
//!
//! 服务多副本部署时，每次检查先将名义限额和突发容量除以当前副本数，
//! 使各副本本地容量之和近似等于全局容量。副本数变化时，已有桶的速率和容量
//! 原地更新（容量缩小时令牌数被截断），保留已消耗的历史。
//!
//! 不同键的数量有硬上限；达到上限后新键直接拒绝，已有键不受影响。

use crate::constants::{DEFAULT_MAX_LOCAL_KEYS, LOCAL_BACKEND_TYPE};
use crate::decision::{EffectiveLimit, QuotaInfo, QuotaResult};
use crate::error::QuotaGuardError;
use crate::storage::{QueryableBackend, QuotaBackend, ResettableBackend};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// 副本数提供者
// ============================================================================

/// 副本数提供者
pub trait ReplicaCountProvider: Send + Sync {
    /// 当前预期副本数；返回 0 时按 1 处理
    fn replica_count(&self) -> usize;
}

/// 固定副本数
#[derive(Debug, Clone, Copy)]
pub struct StaticReplicaCount(pub usize);

impl ReplicaCountProvider for StaticReplicaCount {
    fn replica_count(&self) -> usize {
        self.0
    }
}

/// 可在运行时修改的副本数
#[derive(Debug)]
pub struct DynamicReplicaCount {
    count: AtomicUsize,
}

impl DynamicReplicaCount {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    /// 更新副本数
    pub fn set(&self, count: usize) {
        let old = self.count.swap(count, Ordering::AcqRel);
        if old != count {
            info!("副本数变更: {} -> {}", old, count);
        }
    }
}

impl ReplicaCountProvider for DynamicReplicaCount {
    fn replica_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl<F> ReplicaCountProvider for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn replica_count(&self) -> usize {
        self()
    }
}

// ============================================================================
// 令牌桶
// ============================================================================

/// 桶参数：补充速率（令牌/秒）与容量
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub rate: f64,
    pub capacity: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    params: BucketParams,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + self.params.rate * elapsed).min(self.params.capacity);
            self.last_refill = now;
        }
    }

    /// 原地更新参数；容量缩小时截断令牌数
    fn reconfigure(&mut self, params: BucketParams) {
        if self.params != params {
            debug!(
                "刷新令牌桶参数: rate {} -> {}, capacity {} -> {}",
                self.params.rate, params.rate, self.params.capacity, params.capacity
            );
            self.params = params;
            if self.tokens > params.capacity {
                self.tokens = params.capacity;
            }
        }
    }

    fn reset_after(&self) -> Duration {
        seconds(
            (self.params.capacity - self.tokens).max(0.0),
            self.params.rate,
        )
    }
}

fn seconds(tokens: f64, rate: f64) -> Duration {
    if tokens <= 0.0 || rate <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(tokens / rate).unwrap_or(Duration::MAX)
}

/// 单次消费结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// 消费后（或拒绝时）的令牌数
    pub tokens: f64,
    /// 拒绝时需要等待的时间
    pub wait: Duration,
    /// 桶被补满所需时间
    pub reset_after: Duration,
}

/// 令牌桶
///
/// 所有状态由桶自身的锁保护，同一个键上的并发检查被串行化。
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// 创建满桶
    pub fn new(params: BucketParams) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: params.capacity,
                params,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 以给定参数尝试消费 `n` 个令牌
    ///
    /// 参数与当前不同时先原地刷新，再补充令牌并判定。
    pub fn try_consume(&self, params: BucketParams, n: f64) -> ConsumeOutcome {
        let mut state = self.state.lock();
        state.reconfigure(params);
        state.refill(Instant::now());

        if state.tokens >= n {
            state.tokens -= n;
            ConsumeOutcome {
                allowed: true,
                tokens: state.tokens,
                wait: Duration::ZERO,
                reset_after: state.reset_after(),
            }
        } else {
            ConsumeOutcome {
                allowed: false,
                tokens: state.tokens,
                wait: seconds(n - state.tokens, state.params.rate),
                reset_after: state.reset_after(),
            }
        }
    }

    /// 读取补充后的令牌数，不消费
    pub fn peek(&self, params: BucketParams) -> (f64, Duration) {
        let mut state = self.state.lock();
        state.reconfigure(params);
        state.refill(Instant::now());
        (state.tokens, state.reset_after())
    }

    /// 显式原地更新参数
    pub fn reconfigure(&self, params: BucketParams) {
        self.state.lock().reconfigure(params);
    }

    /// 当前参数
    pub fn params(&self) -> BucketParams {
        self.state.lock().params
    }

    /// 在 `now` 时刻是否已补满
    fn is_full_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.refill(now);
        state.tokens >= state.params.capacity
    }
}

// ============================================================================
// 本地后端
// ============================================================================

/// 本地令牌桶后端
///
/// # 示例
/// ```rust
/// use quotaguard::decision::EffectiveLimit;
/// use quotaguard::limiters::LocalBackend;
/// use quotaguard::storage::QuotaBackend;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let backend = LocalBackend::new(1000);
/// let limit = EffectiveLimit::new(10, 0, Duration::from_secs(1));
///
/// let result = backend.check("tenant:acme", &limit, 1).await.unwrap();
/// assert!(result.allowed);
/// assert_eq!(result.remaining, 9);
/// # }
/// ```
pub struct LocalBackend {
    buckets: DashMap<String, Arc<TokenBucket>>,
    /// 桶数量（安全阀计数器，无需持有任何桶锁即可读取）
    bucket_count: AtomicUsize,
    max_keys: usize,
    replicas: Arc<dyn ReplicaCountProvider>,
}

impl LocalBackend {
    /// 创建单副本的本地后端
    pub fn new(max_keys: usize) -> Self {
        Self::with_replicas(max_keys, Arc::new(StaticReplicaCount(1)))
    }

    /// 创建带副本数提供者的本地后端
    ///
    /// # 参数
    /// - `max_keys`: 最大键数量（0 使用默认值）
    /// - `replicas`: 副本数提供者
    pub fn with_replicas(max_keys: usize, replicas: Arc<dyn ReplicaCountProvider>) -> Self {
        let max_keys = if max_keys == 0 {
            DEFAULT_MAX_LOCAL_KEYS
        } else {
            max_keys
        };
        info!("创建本地令牌桶后端: max_keys={}", max_keys);

        Self {
            buckets: DashMap::new(),
            bucket_count: AtomicUsize::new(0),
            max_keys,
            replicas,
        }
    }

    /// 当前副本数（至少为1）
    pub fn replica_count(&self) -> usize {
        self.replicas.replica_count().max(1)
    }

    /// 按副本数划分后的桶参数与本地限额
    pub fn partition(&self, limit: &EffectiveLimit) -> (BucketParams, u64) {
        let replicas = self.replica_count() as f64;
        let local_limit = (limit.limit as f64 / replicas).max(1.0);
        let capacity = (limit.burst as f64 / replicas).max(1.0);
        let window = limit.window.as_secs_f64().max(f64::EPSILON);

        (
            BucketParams {
                rate: local_limit / window,
                capacity,
            },
            local_limit.floor() as u64,
        )
    }

    /// 获取或创建键对应的桶
    fn acquire(&self, key: &str, params: BucketParams) -> Result<Arc<TokenBucket>, QuotaGuardError> {
        let existing = self.buckets.get(key).map(|b| Arc::clone(b.value()));
        if let Some(bucket) = existing {
            return Ok(bucket);
        }

        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                if self.bucket_count.fetch_add(1, Ordering::AcqRel) >= self.max_keys {
                    self.bucket_count.fetch_sub(1, Ordering::AcqRel);
                    return Err(QuotaGuardError::CapacityExceeded {
                        limit: self.max_keys,
                    });
                }
                let bucket = Arc::new(TokenBucket::new(params));
                entry.insert(Arc::clone(&bucket));
                Ok(bucket)
            }
        }
    }

    /// 已跟踪的键数量
    pub fn len(&self) -> usize {
        self.bucket_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 键数量上限
    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// 是否已有该键的桶
    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// 移除空闲桶
    ///
    /// 只移除已补满且没有进行中检查引用的桶；满桶与新建桶等价，不会丢失配额历史。
    /// 返回移除的数量。
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let keep = Arc::strong_count(bucket) > 1 || !bucket.is_full_at(now);
            if !keep {
                self.bucket_count.fetch_sub(1, Ordering::AcqRel);
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!("清理空闲令牌桶: {}", removed);
        }
        removed
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOCAL_KEYS)
    }
}

#[async_trait]
impl QuotaBackend for LocalBackend {
    async fn check(
        &self,
        key: &str,
        limit: &EffectiveLimit,
        n: u64,
    ) -> Result<QuotaResult, QuotaGuardError> {
        let (params, local_limit) = self.partition(limit);

        let bucket = match self.acquire(key, params) {
            Ok(bucket) => bucket,
            Err(QuotaGuardError::CapacityExceeded { limit: max }) => {
                warn!("本地键数量达到上限 {}，拒绝新键: {}", max, key);
                return Ok(QuotaResult::denied(
                    local_limit,
                    0,
                    limit.window,
                    limit.window,
                ));
            }
            Err(e) => return Err(e),
        };

        let outcome = bucket.try_consume(params, n as f64);
        let remaining = outcome.tokens.max(0.0).floor() as u64;

        Ok(if outcome.allowed {
            QuotaResult::allowed(local_limit, remaining, outcome.reset_after)
        } else {
            QuotaResult::denied(local_limit, remaining, outcome.reset_after, outcome.wait)
        })
    }

    fn backend_type(&self) -> &str {
        LOCAL_BACKEND_TYPE
    }

    async fn close(&self) -> Result<(), QuotaGuardError> {
        self.buckets.clear();
        self.bucket_count.store(0, Ordering::Release);
        info!("本地令牌桶后端已关闭");
        Ok(())
    }

    fn as_resettable(&self) -> Option<&dyn ResettableBackend> {
        Some(self)
    }

    fn as_queryable(&self) -> Option<&dyn QueryableBackend> {
        Some(self)
    }
}

#[async_trait]
impl ResettableBackend for LocalBackend {
    async fn reset(&self, key: &str) -> Result<(), QuotaGuardError> {
        if self.buckets.remove(key).is_some() {
            self.bucket_count.fetch_sub(1, Ordering::AcqRel);
            debug!("重置本地令牌桶: {}", key);
        }
        Ok(())
    }
}

#[async_trait]
impl QueryableBackend for LocalBackend {
    async fn query(
        &self,
        key: &str,
        limit: &EffectiveLimit,
    ) -> Result<QuotaInfo, QuotaGuardError> {
        let (params, local_limit) = self.partition(limit);
        let existing = self.buckets.get(key).map(|b| Arc::clone(b.value()));

        Ok(match existing {
            Some(bucket) => {
                let (tokens, reset_after) = bucket.peek(params);
                QuotaInfo::new(local_limit, tokens.max(0.0).floor() as u64, reset_after)
            }
            None => QuotaInfo::new(local_limit, params.capacity.floor() as u64, Duration::ZERO),
        })
    }
}
