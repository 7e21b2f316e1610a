//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from QuotaGuard,
//! allowing users to import them with a single `use quotaguard::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::{EngineConfig, FallbackMode, Override, Rule};
pub use crate::decision::{QuotaInfo, QuotaResult};
pub use crate::error::{QuotaGuardError, StorageError};
pub use crate::governor::Governor;
pub use crate::key::QuotaKey;

// Backends
pub use crate::limiters::{DynamicReplicaCount, LocalBackend, StaticReplicaCount};
pub use crate::storage::{DistributedBackend, DistributedStore, QuotaBackend};

// Callbacks and metrics
pub use crate::telemetry::{Hooks, QuotaObserver};

// Feature-gated exports
#[cfg(feature = "fallback")]
pub use crate::fallback::FallbackGovernor;

#[cfg(feature = "monitoring")]
pub use crate::telemetry::PrometheusObserver;
