//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each subscription plan
    pub price_ids: PriceIds,
    /// Rewardful API key for affiliate conversion tracking (optional)
    pub rewardful_api_key: Option<String>,
}

/// Stripe price IDs for the subscription plans.
/// Anything outside these two resolves to the `custom` plan.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub starter: String,
    pub pro: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                starter: std::env::var("STRIPE_STARTER_PRICE_ID").map_err(|_| {
                    BillingError::Config("STRIPE_STARTER_PRICE_ID not set".to_string())
                })?,
                pro: std::env::var("STRIPE_PRO_PRICE_ID")
                    .map_err(|_| BillingError::Config("STRIPE_PRO_PRICE_ID not set".to_string()))?,
            },
            rewardful_api_key: std::env::var("REWARDFUL_API_KEY").ok(),
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
