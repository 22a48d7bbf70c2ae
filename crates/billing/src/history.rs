//! Payment history log
//!
//! Append-only ledger of payment attempts. Rows are never updated or
//! deleted; this is the audit trail customer support and reconciliation
//! tooling read from.

use serde::Serialize;
use sqlx::{PgExecutor, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Outcome of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Whether the payment was recurring or a one-off purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentType {
    Subscription,
    OneTime,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::OneTime => "one-time",
        }
    }
}

/// A payment attempt to record.
#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub user_id: Uuid,
    pub stripe_session_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    /// Minor currency units.
    pub amount: i64,
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    pub referral_id: Option<String>,
}

/// A stored payment history row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_session_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub amount: i64,
    pub status: String,
    #[sqlx(rename = "type")]
    pub payment_type: String,
    pub referral_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Service for the append-only `payment_history` table.
pub struct PaymentHistory {
    pool: PgPool,
}

impl PaymentHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one payment attempt. Pure insert; takes any executor so it
    /// participates in the caller's transaction.
    pub async fn append<'e, E>(db: E, record: NewPaymentRecord) -> BillingResult<Uuid>
    where
        E: PgExecutor<'e>,
    {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO payment_history
                (user_id, stripe_session_id, stripe_subscription_id, amount, status, type, referral_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(record.user_id)
        .bind(record.stripe_session_id.as_deref())
        .bind(record.stripe_subscription_id.as_deref())
        .bind(record.amount)
        .bind(record.status.as_str())
        .bind(record.payment_type.as_str())
        .bind(record.referral_id.as_deref())
        .fetch_one(db)
        .await?;

        Ok(id)
    }

    /// Payment attempts for one user, newest first. Support lookups and
    /// idempotency inspection.
    pub async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_session_id, stripe_subscription_id,
                   amount, status, type, referral_id, created_at
            FROM payment_history
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_type_wire_values() {
        assert_eq!(PaymentStatus::Completed.as_str(), "completed");
        assert_eq!(PaymentStatus::Failed.as_str(), "failed");
        assert_eq!(PaymentType::Subscription.as_str(), "subscription");
        assert_eq!(PaymentType::OneTime.as_str(), "one-time");
    }
}
