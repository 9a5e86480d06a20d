//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for RateShield.
//!
//! Default policy table values, sweep timing, header names and validation
//! limits live here so that no magic numbers are scattered through the crate.

// ============================================================================
// Category names
// ============================================================================

/// General API traffic.
pub const CATEGORY_GENERAL: &str = "general";

/// Authentication attempts. Counts failed attempts only and escalates to an
/// address-level block.
pub const CATEGORY_AUTH: &str = "auth";

/// Password reset requests.
pub const CATEGORY_PASSWORD_RESET: &str = "passwordReset";

/// Protected-resource reads.
pub const CATEGORY_PHI: &str = "phi";

/// Bulk data exports.
pub const CATEGORY_EXPORT: &str = "export";

/// File downloads.
pub const CATEGORY_DOWNLOAD: &str = "download";

/// API key issuance.
pub const CATEGORY_API_KEY_ISSUANCE: &str = "apiKeyIssuance";

// ============================================================================
// Time constants
// ============================================================================

/// One minute in seconds.
pub const MINUTE_SECS: u64 = 60;

/// One hour in seconds.
pub const HOUR_SECS: u64 = 3600;

/// One day in seconds.
pub const DAY_SECS: u64 = 86400;

/// Default sweep interval (5 minutes).
///
/// How often the background sweeper evicts expired counters and blocks.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * MINUTE_SECS;

/// Default grace added to a counter window before the sweeper may evict it.
pub const DEFAULT_SWEEP_GRACE_SECS: u64 = 0;

/// Upper bound for a manual block (30 days).
pub const MAX_MANUAL_BLOCK_SECS: u64 = 30 * DAY_SECS;

/// Upper bound for a policy window or block duration (365 days).
pub const MAX_POLICY_DURATION_SECS: u64 = 365 * DAY_SECS;

// ============================================================================
// Response headers
// ============================================================================

/// Policy maximum for the category.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";

/// Remaining requests in the current window (floor 0).
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";

/// Window reset or block expiry, ISO-8601.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// Seconds until the caller may retry.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

// ============================================================================
// Identity / audit
// ============================================================================

/// Address used when neither a forwarded chain nor a transport address is known.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Audit user id for unauthenticated requests.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Audit resource name for every event produced by this crate.
pub const AUDIT_RESOURCE: &str = "rate_limit";

/// Maximum user id length accepted by administrative operations.
pub const MAX_USER_ID_LENGTH: usize = 100;

/// Maximum IP address literal length (IPv6 with zone id).
pub const MAX_IP_ADDRESS_LENGTH: usize = 45;

/// Default capacity of the audit event channel.
pub const DEFAULT_AUDIT_CHANNEL_CAPACITY: usize = 10_000;

/// Default audit batch size.
pub const DEFAULT_AUDIT_BATCH_SIZE: usize = 100;

/// Default audit batch flush timeout (5 seconds).
pub const DEFAULT_AUDIT_BATCH_TIMEOUT_SECS: u64 = 5;
