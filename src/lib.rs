//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! RateShield - Adaptive Rate Limiting and Abuse Blocking
//!
//! Fixed-window request counting per category and identifier, escalation of
//! repeated violations into temporary blocks, and a category-agnostic address
//! block list consulted before every evaluation.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use rateshield::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Governor`] - Request-facing decision wrapper and admin surface
//! - [`ShieldConfig`] - Category policies, sweep timing, audit settings
//! - [`Decision`] - Allowed (with quota headers) or rejected
//! - [`ShieldError`] - Error types
//!
//! ## Storage
//!
//! [`CounterStore`] and [`BlockStore`] traits with the sharded in-memory
//! [`MemoryStorage`] backend.
//!
//! # Examples
//!
//! ```rust
//! use rateshield::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let governor = Governor::in_memory(ShieldConfig::default(), Arc::new(NullAuditSink)).unwrap();
//!
//!     let request = RequestContext::new()
//!         .with_user_id("42")
//!         .with_remote_addr("203.0.113.7");
//!
//!     let decision = governor.check("general", &request).await.unwrap();
//!     assert!(decision.is_allowed());
//! }
//! ```
//!
//! # Features
//!
//! - **Per-category policies**: window, quota and optional block duration
//! - **Escalation**: repeated violations become temporary account and address blocks
//! - **Conditional counting**: categories can count failed requests only
//! - **Background sweeping**: bounded memory with lazy expiry on access
//! - **Audit trail**: channel-backed, non-blocking audit event pipeline

pub mod prelude;

pub mod audit_log;
pub mod ban_manager;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod governor;
pub mod identifier;
pub mod log_redaction;
pub mod storage;
pub mod sweeper;
#[cfg(feature = "telemetry")]
pub mod telemetry;

// 重新导出常用类型
pub use audit_log::{
    AuditAction, AuditEvent, AuditLogConfig, AuditLogStats, AuditLogger, AuditSink, NullAuditSink,
};
pub use ban_manager::BanManager;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{default_policies, Policy, PolicyRegistry, ShieldConfig};
pub use error::{Decision, RejectReason, Rejection, ShieldError, StorageError};
pub use governor::{Admission, FinalizeGuard, Governor, RateLimitHeaders, RateLimitStats};
pub use identifier::{Identifier, RequestContext};
pub use storage::{
    BlockEntry, BlockSource, BlockStore, CounterEntry, CounterStats, CounterStore, MemoryStorage,
    Verdict,
};
pub use sweeper::{SweepReport, Sweeper};
#[cfg(feature = "telemetry")]
pub use telemetry::init_tracing;
