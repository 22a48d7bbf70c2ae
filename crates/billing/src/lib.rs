// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! GhostTools Billing Module
//!
//! Handles Stripe integration for the credit ledger, subscriptions, and
//! payment reconciliation.
//!
//! ## Features
//!
//! - **Webhooks**: Verify and reconcile Stripe events into local state
//! - **Credit Ledger**: Atomic grant/set/debit operations per user
//! - **Subscriptions**: Mirror provider subscription lifecycle
//! - **Payment History**: Append-only audit trail of payment attempts
//! - **Checkout Fulfillment**: Credit allocation for one-time purchases
//! - **Usage Metering**: Debit credits per tool invocation
//! - **Referral Tracking**: Best-effort affiliate conversion reporting

pub mod checkout;
pub mod client;
pub mod credits;
pub mod error;
pub mod history;
pub mod plans;
pub mod referral;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{credits_for_amount, CheckoutFulfillment};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Credits
pub use credits::CreditLedger;

// Error
pub use error::{BillingError, BillingResult};

// History
pub use history::{NewPaymentRecord, PaymentHistory, PaymentRecord, PaymentStatus, PaymentType};

// Referral
pub use referral::{Conversion, ReferralTracker};

// Subscriptions
pub use subscriptions::{SubscriptionService, SubscriptionUpsert};

// Usage
pub use usage::{UsageMeter, UsageRecord};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub history: PaymentHistory,
    pub subscriptions: SubscriptionService,
    pub usage: UsageMeter,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let referral = ReferralTracker::new(stripe.config().rewardful_api_key.clone());

        Self {
            history: PaymentHistory::new(pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            usage: UsageMeter::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, referral),
        }
    }

    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }
}
