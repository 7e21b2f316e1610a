//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配额后端抽象层
//!
//! - [`QuotaBackend`]: 所有后端都必须实现的检查接口
//! - [`ResettableBackend`] / [`QueryableBackend`]: 可选能力，通过
//!   `as_resettable` / `as_queryable` 显式声明；不支持的后端返回 `None`，
//!   调用方据此报告"不支持"而不是静默成功
//! - [`DistributedStore`]: 外部分布式配额存储的四操作契约
//! - [`DistributedBackend`]: 将 `DistributedStore` 适配为 `QuotaBackend`

use crate::decision::{EffectiveLimit, QuotaInfo, QuotaResult};
use crate::error::{QuotaGuardError, StorageError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 配额后端接口
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// 检查并消耗 `n` 个令牌
    ///
    /// # 参数
    /// - `key`: 完整的存储键
    /// - `limit`: 生效限额
    /// - `n`: 请求的令牌数（> 0）
    ///
    /// # 返回
    /// - `Ok(result)`: 判定结果（拒绝不是错误）
    /// - `Err(_)`: 后端故障
    async fn check(
        &self,
        key: &str,
        limit: &EffectiveLimit,
        n: u64,
    ) -> Result<QuotaResult, QuotaGuardError>;

    /// 后端类型名（用于指标标签）
    fn backend_type(&self) -> &str;

    /// 关闭后端，释放资源
    async fn close(&self) -> Result<(), QuotaGuardError> {
        Ok(())
    }

    /// 重置能力
    fn as_resettable(&self) -> Option<&dyn ResettableBackend> {
        None
    }

    /// 查询能力
    fn as_queryable(&self) -> Option<&dyn QueryableBackend> {
        None
    }
}

/// 可重置的后端
#[async_trait]
pub trait ResettableBackend: Send + Sync {
    /// 清除键的配额状态
    async fn reset(&self, key: &str) -> Result<(), QuotaGuardError>;
}

/// 可查询的后端
#[async_trait]
pub trait QueryableBackend: Send + Sync {
    /// 读取键的配额快照，不消耗配额
    async fn query(&self, key: &str, limit: &EffectiveLimit)
        -> Result<QuotaInfo, QuotaGuardError>;
}

// ============================================================================
// 分布式存储契约
// ============================================================================

/// 分布式配额存储
///
/// 由嵌入方实现（例如基于 Redis 的脚本），本 crate 只依赖这一契约。
/// 网络/连接/超时类故障应以 [`StorageError::ConnectionError`]、
/// [`StorageError::TimeoutError`] 或 [`StorageError::Unavailable`] 返回，
/// 这些错误会触发降级；其他错误原样传播。
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// 检查并消耗
    async fn check_and_consume(
        &self,
        key: &str,
        limit: &EffectiveLimit,
        n: u64,
    ) -> Result<QuotaResult, StorageError>;

    /// 重置
    async fn reset(&self, key: &str) -> Result<(), StorageError>;

    /// 查询剩余配额，不消耗
    async fn query(&self, key: &str, limit: &EffectiveLimit) -> Result<QuotaInfo, StorageError>;

    /// 关闭连接
    async fn close(&self) -> Result<(), StorageError>;

    /// 存储类型名
    fn type_name(&self) -> &str;
}

/// 分布式后端适配器
///
/// 为每次调用施加可选的超时；超时视为存储不可达。
/// 调用方丢弃评估 future 即取消进行中的调用。
pub struct DistributedBackend {
    store: Arc<dyn DistributedStore>,
    timeout: Option<Duration>,
    type_label: String,
}

impl DistributedBackend {
    /// 创建分布式后端
    ///
    /// # 参数
    /// - `store`: 分布式存储实现
    /// - `timeout`: 单次调用超时（`None` 表示不限制）
    pub fn new(store: Arc<dyn DistributedStore>, timeout: Option<Duration>) -> Self {
        let type_label = format!("distributed:{}", store.type_name());
        Self {
            store,
            timeout,
            type_label,
        }
    }

    /// 底层存储
    pub fn store(&self) -> &Arc<dyn DistributedStore> {
        &self.store
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, QuotaGuardError>
    where
        F: Future<Output = Result<T, StorageError>> + Send,
    {
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("分布式存储调用超时: op={}, timeout={:?}", op, timeout);
                    Err(StorageError::TimeoutError(format!(
                        "{} 超过 {:?}",
                        op, timeout
                    )))
                }
            },
            None => fut.await,
        };

        if let Err(e) = &result {
            debug!("分布式存储调用失败: op={}, error={}", op, e);
        }

        result.map_err(QuotaGuardError::from)
    }
}

#[async_trait]
impl QuotaBackend for DistributedBackend {
    async fn check(
        &self,
        key: &str,
        limit: &EffectiveLimit,
        n: u64,
    ) -> Result<QuotaResult, QuotaGuardError> {
        self.call("check", self.store.check_and_consume(key, limit, n))
            .await
    }

    fn backend_type(&self) -> &str {
        &self.type_label
    }

    async fn close(&self) -> Result<(), QuotaGuardError> {
        self.call("close", self.store.close()).await
    }

    fn as_resettable(&self) -> Option<&dyn ResettableBackend> {
        Some(self)
    }

    fn as_queryable(&self) -> Option<&dyn QueryableBackend> {
        Some(self)
    }
}

#[async_trait]
impl ResettableBackend for DistributedBackend {
    async fn reset(&self, key: &str) -> Result<(), QuotaGuardError> {
        self.call("reset", self.store.reset(key)).await
    }
}

#[async_trait]
impl QueryableBackend for DistributedBackend {
    async fn query(
        &self,
        key: &str,
        limit: &EffectiveLimit,
    ) -> Result<QuotaInfo, QuotaGuardError> {
        self.call("query", self.store.query(key, limit)).await
    }
}
