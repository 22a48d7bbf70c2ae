//! Usage metering
//!
//! The tool-invocation side of the ledger: each paid tool run debits
//! credits and records a usage row in one transaction. The conditional
//! debit means a concurrent run cannot push the balance below zero.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};

/// A recorded tool invocation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tool: String,
    pub credits_used: i64,
    pub created_at: OffsetDateTime,
}

/// Meters tool usage against the credit ledger.
pub struct UsageMeter {
    pool: PgPool,
}

impl UsageMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Debit credits for one tool run and log it. Returns the remaining
    /// balance; surfaces [`BillingError::InsufficientCredits`] untouched so
    /// the caller can map it to a payment-required response.
    pub async fn record(&self, user_id: Uuid, tool: &str, credits: i64) -> BillingResult<i64> {
        if credits <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "usage must consume at least one credit, got {}",
                credits
            )));
        }

        let mut tx = self.pool.begin().await?;

        let remaining = CreditLedger::debit(&mut *tx, user_id, credits).await?;

        sqlx::query(
            r#"
            INSERT INTO usage_history (user_id, tool, credits_used)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(tool)
        .bind(credits)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            user_id = %user_id,
            tool = tool,
            credits_used = credits,
            remaining = remaining,
            "Tool usage recorded"
        );

        Ok(remaining)
    }

    /// Credits consumed so far this calendar month.
    pub async fn month_usage(&self, user_id: Uuid) -> BillingResult<i64> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(credits_used), 0)::BIGINT
            FROM usage_history
            WHERE user_id = $1
              AND created_at >= date_trunc('month', NOW())
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Recent usage rows for one user, newest first.
    pub async fn list_for_user(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<UsageRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT id, user_id, tool, credits_used, created_at
            FROM usage_history
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
