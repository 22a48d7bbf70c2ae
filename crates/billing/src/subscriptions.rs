//! Subscription management
//!
//! Mirrors Stripe subscription objects into the local `subscriptions`
//! table. One row per provider subscription id (upsert semantics); rows
//! survive cancellation so a paid-up period keeps granting entitlement
//! until it lapses.

use sqlx::{PgConnection, PgExecutor, PgPool};
use stripe::{Subscription, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use ghosttools_shared::{PlanId, SubscriptionRecord};

use crate::client::StripeClient;
use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};
use crate::plans;

/// Fields written on every subscription upsert.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    /// Provider-reported status string, passed through verbatim.
    pub status: String,
    pub plan_id: PlanId,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
}

/// Subscription service for mirroring Stripe subscriptions
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Get the Stripe client for config access
    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    /// Insert or fully overwrite the row matched by provider subscription id.
    pub async fn upsert<'e, E>(db: E, fields: &SubscriptionUpsert) -> BillingResult<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, stripe_subscription_id, status, plan_id, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                status = EXCLUDED.status,
                plan_id = EXCLUDED.plan_id,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                updated_at = NOW()
            "#,
        )
        .bind(fields.user_id)
        .bind(&fields.stripe_subscription_id)
        .bind(&fields.status)
        .bind(fields.plan_id.as_str())
        .bind(fields.start_date)
        .bind(fields.end_date)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Cancel: status becomes `canceled` and the end date is pinned to the
    /// cancellation timestamp, regardless of prior status. Returns rows
    /// affected so callers can log a missing-row skip.
    pub async fn mark_canceled<'e, E>(
        db: E,
        stripe_subscription_id: &str,
        end_date: OffsetDateTime,
    ) -> BillingResult<u64>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', end_date = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(end_date)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Renewal: extend the validity window without touching status.
    pub async fn extend_period<'e, E>(
        db: E,
        stripe_subscription_id: &str,
        end_date: OffsetDateTime,
    ) -> BillingResult<u64>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET end_date = $2, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(end_date)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Escalation after repeated invoice failures.
    pub async fn mark_past_due<'e, E>(db: E, stripe_subscription_id: &str) -> BillingResult<u64>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Look up the local row for a provider subscription id.
    pub async fn find_by_stripe_id<'e, E>(
        db: E,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>
    where
        E: PgExecutor<'e>,
    {
        let record = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_subscription_id, status, plan_id,
                   start_date, end_date, created_at, updated_at
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(db)
        .await?;

        Ok(record)
    }

    /// The user's current subscription: active, or canceled with paid-up
    /// time remaining. Most recently created wins.
    pub async fn find_current(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_subscription_id, status, plan_id,
                   start_date, end_date, created_at, updated_at
            FROM subscriptions
            WHERE user_id = $1
              AND (status = 'active' OR (status = 'canceled' AND end_date > NOW()))
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Mirror a Stripe subscription object into the local store and, when
    /// the provider reports it active, apply the plan's fixed credit
    /// allotment. Runs on the caller's transaction so the subscription row
    /// and the ledger write commit together.
    pub async fn sync_from_stripe(
        &self,
        conn: &mut PgConnection,
        user_id: Uuid,
        subscription: &Subscription,
    ) -> BillingResult<PlanId> {
        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string())
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Price id not found in subscription {}",
                    subscription.id
                ))
            })?;

        let plan_id = plans::resolve(&self.stripe.config().price_ids, &price_id);

        let fields = SubscriptionUpsert {
            user_id,
            stripe_subscription_id: subscription.id.to_string(),
            status: subscription.status.to_string(),
            plan_id,
            start_date: OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
                .unwrap_or_else(|_| OffsetDateTime::now_utc()),
            end_date: OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                .unwrap_or_else(|_| OffsetDateTime::now_utc()),
        };

        Self::upsert(&mut *conn, &fields).await?;

        // Allotments are tied to subscription lifecycle events only; invoice
        // renewals extend the window without re-granting (see DESIGN.md).
        let allotment = plan_id.credit_allotment();
        if subscription.status == SubscriptionStatus::Active && allotment > 0 {
            CreditLedger::set_balance(&mut *conn, user_id, allotment).await?;
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan = %plan_id,
            status = %subscription.status,
            "Subscription synced"
        );

        Ok(plan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PriceIds, StripeConfig};
    use ghosttools_shared::create_pool;
    use time::Duration;

    fn stripe_client() -> StripeClient {
        StripeClient::new(StripeConfig {
            secret_key: "sk_test_unused".to_string(),
            webhook_secret: "whsec_unused".to_string(),
            price_ids: PriceIds {
                starter: "price_starter".to_string(),
                pro: "price_pro".to_string(),
            },
            rewardful_api_key: None,
        })
    }

    async fn insert_user(pool: &PgPool) -> Uuid {
        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
            .bind(user_id)
            .bind(format!("{}@test.invalid", user_id))
            .execute(pool)
            .await
            .unwrap();
        user_id
    }

    fn fields(user_id: Uuid, stripe_id: &str, status: &str) -> SubscriptionUpsert {
        let now = OffsetDateTime::now_utc();
        SubscriptionUpsert {
            user_id,
            stripe_subscription_id: stripe_id.to_string(),
            status: status.to_string(),
            plan_id: PlanId::Starter,
            start_date: now,
            end_date: now + Duration::days(30),
        }
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_upsert_is_idempotent_at_field_level() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url).await.expect("Failed to create pool");
        let user_id = insert_user(&pool).await;
        let stripe_id = format!("sub_{}", Uuid::new_v4());

        let upsert = fields(user_id, &stripe_id, "active");
        SubscriptionService::upsert(&pool, &upsert).await.unwrap();
        SubscriptionService::upsert(&pool, &upsert).await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(&stripe_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1, "Upsert must keep one row per provider id");

        let record = SubscriptionService::find_by_stripe_id(&pool, &stripe_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, "active");
        assert_eq!(record.plan_id, "starter");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_canceled_subscription_is_current_until_period_end() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url).await.expect("Failed to create pool");
        let service = SubscriptionService::new(stripe_client(), pool.clone());
        let user_id = insert_user(&pool).await;
        let stripe_id = format!("sub_{}", Uuid::new_v4());

        SubscriptionService::upsert(&pool, &fields(user_id, &stripe_id, "active"))
            .await
            .unwrap();

        // Cancel with paid-up time remaining: still current.
        let future_end = OffsetDateTime::now_utc() + Duration::days(10);
        let rows = SubscriptionService::mark_canceled(&pool, &stripe_id, future_end)
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let current = service.find_current(user_id).await.unwrap().unwrap();
        assert_eq!(current.status, "canceled");
        assert_eq!(current.stripe_subscription_id, stripe_id);

        // Lapsed cancellation: no longer current.
        let past_end = OffsetDateTime::now_utc() - Duration::days(1);
        SubscriptionService::mark_canceled(&pool, &stripe_id, past_end)
            .await
            .unwrap();
        assert!(service.find_current(user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_mark_canceled_reports_missing_rows() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url).await.expect("Failed to create pool");

        let rows = SubscriptionService::mark_canceled(
            &pool,
            "sub_does_not_exist",
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
        assert_eq!(rows, 0);
    }
}
