//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 决策结果类型
//!
//! - [`QuotaResult`]: 一次准入判定的结果
//! - [`QuotaInfo`]: 不消耗配额的只读快照
//! - [`EffectiveLimit`]: 规则与覆盖项合并后的生效限额

use crate::constants::{HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// 生效限额
///
/// 由规则默认值与第一个命中的覆盖项合并得到。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimit {
    /// 窗口内允许的请求数
    pub limit: u64,
    /// 桶容量（已将 0 解析为 limit）
    pub burst: u64,
    /// 窗口长度
    pub window: Duration,
}

impl EffectiveLimit {
    pub fn new(limit: u64, burst: u64, window: Duration) -> Self {
        Self {
            limit,
            burst: if burst == 0 { limit } else { burst },
            window,
        }
    }
}

/// 准入判定结果
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaResult {
    /// 是否放行
    pub allowed: bool,
    /// 生效限额
    pub limit: u64,
    /// 剩余配额
    pub remaining: u64,
    /// 配额完全恢复的时间
    pub reset_at: DateTime<Utc>,
    /// 建议的重试等待时间（放行时为零）
    pub retry_after: Duration,
    /// 产生该结果的规则名
    pub rule: String,
    /// 渲染后的键
    pub key: String,
}

impl QuotaResult {
    /// 放行结果
    pub fn allowed(limit: u64, remaining: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at: reset_time(reset_after),
            retry_after: Duration::ZERO,
            rule: String::new(),
            key: String::new(),
        }
    }

    /// 拒绝结果
    pub fn denied(limit: u64, remaining: u64, reset_after: Duration, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining,
            reset_at: reset_time(reset_after),
            retry_after,
            rule: String::new(),
            key: String::new(),
        }
    }

    /// 没有任何规则生效时的空结果（放行）
    pub fn unmatched() -> Self {
        Self::allowed(0, 0, Duration::ZERO)
    }

    /// 附加规则名与键
    pub fn with_origin(mut self, rule: impl Into<String>, key: impl Into<String>) -> Self {
        self.rule = rule.into();
        self.key = key.into();
        self
    }

    /// 生成限流响应头
    ///
    /// `Retry-After` 只在拒绝时给出，按整秒向上取整。
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at.timestamp().to_string()),
        ];

        if !self.allowed {
            let secs = self.retry_after.as_secs()
                + u64::from(self.retry_after.subsec_nanos() > 0);
            headers.push((HEADER_RETRY_AFTER, secs.to_string()));
        }

        headers
    }
}

/// 配额快照
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// 快照对应的规则名（由评估核心填写）
    pub rule: String,
    /// 快照对应的渲染键（由评估核心填写）
    pub key: String,
}

impl QuotaInfo {
    pub fn new(limit: u64, remaining: u64, reset_after: Duration) -> Self {
        Self {
            limit,
            remaining,
            reset_at: reset_time(reset_after),
            rule: String::new(),
            key: String::new(),
        }
    }
}

/// 超出可表示范围的时间截断为最大时间
fn reset_time(after: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|after| now.checked_add_signed(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
