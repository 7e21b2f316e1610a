//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! QuotaGuard - Admission Control Engine
//!
//! Decides whether a request identity (tenant, caller, method, path, resource and
//! free-form extras) is admitted against a layered set of quota rules, using a
//! shared distributed quota store with an in-process token bucket fallback.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use quotaguard::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Governor`] - Evaluation core over a single backend
//! - [`FallbackGovernor`] - Distributed backend with degradation strategies (requires `fallback` feature)
//! - [`EngineConfig`] - Validated engine configuration and builder
//! - [`QuotaKey`] - Request identity and key-template rendering
//! - [`QuotaResult`] / [`QuotaInfo`] - Decisions and read-only snapshots
//! - [`QuotaGuardError`] - Error types
//!
//! ## Backends
//!
//! - [`LocalBackend`] - Sharded map of per-key token buckets with replica division
//! - [`DistributedBackend`] - Adapter over any [`DistributedStore`]
//!
//! ## Extensions (feature-gated)
//!
//! - Prometheus observer (requires `monitoring` feature)
//!
//! # Rule evaluation
//!
//! Enabled rules are applied in declaration order. The first rule that denies
//! short-circuits the evaluation; when every rule admits, the result with the
//! smallest remaining quota is returned. Overrides are matched against the
//! rendered key in declaration order and the **first** match wins, so list
//! narrow patterns before broad ones.
//!
//! # Examples
//!
//! ```rust
//! use quotaguard::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::builder()
//!         .rule(Rule::new("global", "global", 1000, Duration::from_secs(1)))
//!         .rule(Rule::new("tenant", "tenant:${tenant_id}", 5, Duration::from_secs(60)))
//!         .build()
//!         .unwrap();
//!     let governor = Governor::local(&config).unwrap();
//!
//!     let key = QuotaKey::new().with_tenant("acme");
//!     let result = governor.evaluate(&key).await.unwrap();
//!     assert!(result.allowed);
//!     assert_eq!(result.rule, "tenant");
//!     assert_eq!(result.remaining, 4);
//! }
//! ```

pub mod prelude;

pub mod config;
pub mod constants;
pub mod decision;
pub mod error;
#[cfg(feature = "fallback")]
pub mod fallback;
pub mod governor;
pub mod key;
pub mod limiters;
pub mod matchers;
pub mod storage;
pub mod telemetry;

// 重新导出常用类型
pub use config::{CustomFallback, EngineConfig, EngineConfigBuilder, FallbackMode, Override, Rule};
pub use decision::{EffectiveLimit, QuotaInfo, QuotaResult};
pub use error::{QuotaGuardError, StorageError};
#[cfg(feature = "fallback")]
pub use fallback::FallbackGovernor;
pub use governor::Governor;
pub use key::QuotaKey;
pub use limiters::{
    DynamicReplicaCount, LocalBackend, ReplicaCountProvider, StaticReplicaCount, TokenBucket,
};
pub use matchers::{wildcard_match, MatcherStats, RuleMatcher};
pub use storage::{
    DistributedBackend, DistributedStore, QueryableBackend, QuotaBackend, ResettableBackend,
};
#[cfg(feature = "monitoring")]
pub use telemetry::PrometheusObserver;
pub use telemetry::{Hooks, NoopObserver, QuotaObserver};
