//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from RateShield,
//! allowing users to import them with a single `use rateshield::prelude::*;`
//! statement instead of importing each type individually.

// Core types
pub use crate::config::{Policy, ShieldConfig};
pub use crate::error::{Decision, Rejection, ShieldError};
pub use crate::governor::{Admission, Governor, RateLimitHeaders};

// Request identity
pub use crate::identifier::{Identifier, RequestContext};

// Storage and time
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::storage::{BlockStore, CounterStore, MemoryStorage};

// Audit
pub use crate::audit_log::{AuditLogConfig, AuditLogger, AuditSink, NullAuditSink};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::init_tracing;
