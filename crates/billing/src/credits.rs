//! Credit ledger
//!
//! The authoritative per-user credit balance. All mutations are single
//! atomic statements at the store level so concurrent webhook deliveries
//! and tool invocations cannot lose updates. Operations take any Postgres
//! executor so handlers can run them inside their own transaction.

use sqlx::PgExecutor;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Store operations for the `credits` table.
pub struct CreditLedger;

impl CreditLedger {
    /// Add `amount` to the user's balance, creating the ledger row with
    /// that balance if absent. Returns the new balance.
    pub async fn grant<'e, E>(db: E, user_id: Uuid, amount: i64) -> BillingResult<i64>
    where
        E: PgExecutor<'e>,
    {
        if amount < 0 {
            return Err(BillingError::InvalidAmount(format!(
                "cannot grant negative credits: {}",
                amount
            )));
        }

        let (balance,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO credits (user_id, amount)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
                SET amount = credits.amount + EXCLUDED.amount,
                    updated_at = NOW()
            RETURNING amount
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(db)
        .await?;

        Ok(balance)
    }

    /// Overwrite the user's balance with a fixed amount (plan allotments).
    pub async fn set_balance<'e, E>(db: E, user_id: Uuid, amount: i64) -> BillingResult<i64>
    where
        E: PgExecutor<'e>,
    {
        if amount < 0 {
            return Err(BillingError::InvalidAmount(format!(
                "cannot set negative balance: {}",
                amount
            )));
        }

        let (balance,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO credits (user_id, amount)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
                SET amount = EXCLUDED.amount,
                    updated_at = NOW()
            RETURNING amount
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_one(db)
        .await?;

        Ok(balance)
    }

    /// Subtract `amount` from the user's balance, but only if the balance
    /// covers it. Sufficiency check and decrement are one conditional
    /// statement, so there is no window between check and write. Returns
    /// the remaining balance.
    pub async fn debit<'e, E>(db: E, user_id: Uuid, amount: i64) -> BillingResult<i64>
    where
        E: PgExecutor<'e>,
    {
        if amount < 0 {
            return Err(BillingError::InvalidAmount(format!(
                "cannot debit negative credits: {}",
                amount
            )));
        }

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE credits
            SET amount = amount - $2, updated_at = NOW()
            WHERE user_id = $1 AND amount >= $2
            RETURNING amount
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(db)
        .await?;

        row.map(|(balance,)| balance)
            .ok_or(BillingError::InsufficientCredits { requested: amount })
    }

    /// Current balance, 0 if the user has no ledger row yet.
    pub async fn balance<'e, E>(db: E, user_id: Uuid) -> BillingResult<i64>
    where
        E: PgExecutor<'e>,
    {
        let row: Option<(i64,)> = sqlx::query_as("SELECT amount FROM credits WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(db)
            .await?;

        Ok(row.map(|(amount,)| amount).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghosttools_shared::create_pool;

    #[tokio::test]
    async fn test_negative_amounts_rejected_before_touching_the_store() {
        // The guard runs before any query, so a lazy pool that never
        // connects is enough to observe the error.
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let err = CreditLedger::grant(&pool, Uuid::new_v4(), -5).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount(_)));

        let err = CreditLedger::debit(&pool, Uuid::new_v4(), -1).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_debit_refuses_overdraft() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url).await.expect("Failed to create pool");
        let user_id = Uuid::new_v4();

        sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
            .bind(user_id)
            .bind(format!("{}@test.invalid", user_id))
            .execute(&pool)
            .await
            .unwrap();

        CreditLedger::grant(&pool, user_id, 5).await.unwrap();
        assert_eq!(CreditLedger::debit(&pool, user_id, 3).await.unwrap(), 2);

        let err = CreditLedger::debit(&pool, user_id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits { requested: 3 }
        ));
        assert_eq!(CreditLedger::balance(&pool, user_id).await.unwrap(), 2);
    }
}
