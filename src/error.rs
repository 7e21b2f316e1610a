//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型，并提供"存储不可达"分类，
//! 降级编排器只对这一类错误执行降级。

use crate::decision::QuotaResult;
use std::io::ErrorKind;
use thiserror::Error;

/// QuotaGuard 错误类型
#[derive(Error, Debug)]
pub enum QuotaGuardError {
    /// 配置错误（只在构造阶段产生）
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 参数错误
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 本地后端键数量达到上限，新键被拒绝
    #[error("容量超限: 本地键数量已达上限 {limit}")]
    CapacityExceeded { limit: usize },

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 分布式存储不可达且降级策略为拒绝
    #[error("分布式存储不可用，请求已拒绝: {reason}")]
    UnavailableDenied {
        result: Box<QuotaResult>,
        reason: String,
    },

    /// 后端不支持该能力
    #[error("不支持的操作: {0}")]
    NotSupported(String),

    /// 引擎已关闭
    #[error("引擎已关闭")]
    Closed,

    /// 重复关闭
    #[error("引擎已经关闭过")]
    AlreadyClosed,

    /// 多个错误（尽力而为的操作）
    #[error("多个错误: {}", join_messages(.0))]
    Joined(Vec<QuotaGuardError>),

    /// 其他错误
    #[error("未知错误: {0}")]
    Other(String),
}

/// 存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 超时错误
    #[error("超时错误: {0}")]
    TimeoutError(String),

    /// 存储显式声明不可用
    #[error("存储不可用: {0}")]
    Unavailable(String),

    /// 未找到
    #[error("未找到: {0}")]
    NotFound(String),
}

impl StorageError {
    /// 是否属于"存储不可达"类错误
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionError(_)
                | StorageError::TimeoutError(_)
                | StorageError::Unavailable(_)
        )
    }
}

fn join_messages(errors: &[QuotaGuardError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn is_network_io_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
    )
}

impl QuotaGuardError {
    /// 判断错误是否表示分布式存储不可达
    ///
    /// 只有网络、连接、超时类错误和显式的不可用标记会返回 `true`，
    /// 其余错误原样向上传播，不触发降级。
    pub fn is_unavailable(&self) -> bool {
        match self {
            QuotaGuardError::StorageError(e) => e.is_unavailable(),
            QuotaGuardError::IoError(e) => is_network_io_kind(e.kind()),
            QuotaGuardError::UnavailableDenied { .. } => true,
            _ => false,
        }
    }

    /// 调用方是否可以重试
    pub fn is_retryable(&self) -> bool {
        self.is_unavailable()
    }

    /// 不可达原因标签（用于指标）
    pub fn unavailable_reason(&self) -> &'static str {
        match self {
            QuotaGuardError::StorageError(StorageError::ConnectionError(_)) => "connection",
            QuotaGuardError::StorageError(StorageError::TimeoutError(_)) => "timeout",
            QuotaGuardError::StorageError(StorageError::Unavailable(_)) => "unavailable",
            QuotaGuardError::IoError(e) if e.kind() == ErrorKind::TimedOut => "timeout",
            QuotaGuardError::IoError(e) if is_network_io_kind(e.kind()) => "network",
            QuotaGuardError::UnavailableDenied { .. } => "unavailable",
            _ => "other",
        }
    }

    /// 降级拒绝时附带的拒绝结果
    pub fn denied_result(&self) -> Option<&QuotaResult> {
        match self {
            QuotaGuardError::UnavailableDenied { result, .. } => Some(result),
            _ => None,
        }
    }

    /// 将若干错误合并为一个；没有错误时返回 `None`
    pub fn join(mut errors: Vec<QuotaGuardError>) -> Option<QuotaGuardError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(QuotaGuardError::Joined(errors)),
        }
    }
}
