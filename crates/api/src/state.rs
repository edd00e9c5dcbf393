//! Shared application state.

use std::sync::Arc;

use billflow_billing::BillingService;
use billflow_shared::rate_limit::RateLimiter;
use sqlx::PgPool;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingService) -> Self {
        Self {
            pool,
            config,
            billing: Arc::new(billing),
            rate_limiter: Arc::new(RateLimiter::new_in_memory()),
        }
    }
}
