//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use ghosttools_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Arc<BillingService>) -> Self {
        Self {
            pool,
            config,
            billing,
        }
    }
}
