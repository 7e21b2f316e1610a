//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for QuotaGuard.
//!
//! All magic numbers and well-known labels used across the engine live here.

use std::time::Duration;

/// Default ceiling on the number of distinct keys tracked by the local backend.
///
/// Once reached, checks for brand-new keys are denied while keys that already
/// own a bucket keep being served.
pub const DEFAULT_MAX_LOCAL_KEYS: usize = 100_000;

/// Largest limit or burst a rule may declare.
///
/// Local buckets track tokens as `f64`, which is exact for integers up to 2^53.
pub const MAX_QUOTA: u64 = 1 << 53;

/// Rule label recorded in metrics when an evaluation fails with an error.
pub const ERROR_RULE_LABEL: &str = "__error__";

/// Rule name carried by the synthetic result of the fail-open strategy.
pub const FALLBACK_OPEN_RULE: &str = "fallback-open";

/// Rule name carried by the synthetic result of the fail-closed strategy.
pub const FALLBACK_CLOSE_RULE: &str = "fallback-close";

/// Retry hint attached to the synthetic deny of the fail-closed strategy.
pub const FALLBACK_CLOSE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Backend type label of the in-process token bucket backend.
pub const LOCAL_BACKEND_TYPE: &str = "local";

// ============================================================================
// Response headers
// ============================================================================

/// Effective limit of the rule that produced the decision.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";

/// Remaining quota for the tightest rule in force.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";

/// Unix timestamp (seconds) at which the quota is fully replenished.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// Whole seconds the client should wait before retrying a denied request.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";
