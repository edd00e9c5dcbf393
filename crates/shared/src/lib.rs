#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for Billflow services.
//!
//! Database pool creation and migrations, common domain types, and the
//! in-process rate limiter used by the API without pulling in the billing
//! crate.

pub mod db;
pub mod rate_limit;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use types::{ExtensionMap, JobStatus, PaymentStatus, SubscriptionStatus, WebhookStatus};
