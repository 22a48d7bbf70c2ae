//! Stripe webhook handling
//!
//! Verifies webhook deliveries, claims them for exactly-once processing,
//! and reconciles payment and subscription lifecycle events into the
//! local subscription, credit, and payment-history state.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, Customer, Event, EventObject, EventType, Expandable, Invoice, Subscription,
    Webhook,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::checkout::CheckoutFulfillment;
use crate::client::StripeClient;
use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};
use crate::history::{NewPaymentRecord, PaymentHistory, PaymentStatus, PaymentType};
use crate::referral::{Conversion, ReferralTracker};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Signed payloads older than this are rejected by the manual verifier.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A claimed event stuck in `processing` longer than this can be re-claimed
/// by a later delivery (crash recovery).
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// More failed payment attempts than this mark the subscription past due.
const INVOICE_FAILURE_THRESHOLD: u64 = 3;

/// A local user matched to an inbound event.
#[derive(Debug, Clone)]
struct UserRef {
    id: Uuid,
    email: String,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    subscriptions: SubscriptionService,
    checkout: CheckoutFulfillment,
    referral: ReferralTracker,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, referral: ReferralTracker) -> Self {
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());
        let checkout = CheckoutFulfillment::new(stripe.clone());
        Self {
            stripe,
            pool,
            subscriptions,
            checkout,
            referral,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Tries the stripe crate's verifier first, then falls back to manual
    /// signature verification so payloads from newer Stripe API versions
    /// don't bounce on strict parsing.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature(payload, signature, webhook_secret)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event
    ///
    /// Claims the event id in `stripe_webhook_events` before doing any
    /// work. The INSERT...ON CONFLICT...RETURNING claim is atomic, so a
    /// redelivered or concurrently delivered duplicate cannot re-run the
    /// handlers (and cannot double-credit). Events stuck in `processing`
    /// past the timeout are re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
            )
            .bind(&event_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                previous_result = ?existing.map(|(r,)| r),
                "Duplicate webhook delivery, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result; event may appear stuck in 'processing'"
            );
        }

        result
    }

    /// Dispatch over the closed set of recognized event types.
    async fn process_event(&self, event: Event) -> BillingResult<()> {
        match event.type_ {
            // Checkout events. Async payment success carries the same
            // session shape as synchronous completion.
            EventType::CheckoutSessionCompleted
            | EventType::CheckoutSessionAsyncPaymentSucceeded => {
                self.handle_checkout_completed(extract_session(event)?).await
            }
            EventType::CheckoutSessionAsyncPaymentFailed => {
                self.handle_async_payment_failed(extract_session(event)?)
                    .await
            }

            // Subscription lifecycle
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_updated(extract_subscription(event)?)
                    .await
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(extract_subscription(event)?)
                    .await
            }

            // Invoice events
            EventType::InvoicePaymentSucceeded => {
                self.handle_invoice_payment_succeeded(extract_invoice(event)?)
                    .await
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(extract_invoice(event)?)
                    .await
            }

            // Administrative/test events Stripe sends that carry nothing to
            // reconcile. Acknowledged without any writes.
            EventType::AccountUpdated
            | EventType::SetupIntentCreated
            | EventType::PaymentIntentCreated
            | EventType::PaymentMethodAttached => {
                tracing::debug!(event_type = %event.type_, "Ignoring administrative event");
                Ok(())
            }

            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Unhandled Stripe event type"
                );
                Ok(())
            }
        }
    }

    /// checkout.session.completed / checkout.session.async_payment_succeeded
    ///
    /// Records the payment, mirrors a purchased subscription, and grants
    /// credits for one-time purchases. All database writes share one
    /// transaction; the referral notification fires only after commit.
    async fn handle_checkout_completed(&self, session: CheckoutSession) -> BillingResult<()> {
        if session.customer.is_none() && session.customer_email.is_none() {
            tracing::warn!(session_id = %session.id, "Checkout session missing customer details");
            return Ok(());
        }

        let user = match self.resolve_session_user(&session).await? {
            Some(user) => user,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    "No local user for checkout session, skipping"
                );
                return Ok(());
            }
        };

        let is_subscription = session.subscription.is_some();
        let amount = session.amount_total.unwrap_or(0);
        let referral_id = session.client_reference_id.clone();

        // Stripe round-trips happen before the transaction opens so no
        // network call sits inside the database's critical path.
        let stripe_subscription = match &session.subscription {
            Some(Expandable::Object(subscription)) => Some((**subscription).clone()),
            Some(Expandable::Id(id)) => {
                Some(Subscription::retrieve(self.stripe.inner(), id, &[]).await?)
            }
            None => None,
        };

        let credits_to_add = if !is_subscription && amount > 0 {
            self.checkout.resolve_credits(&session).await?
        } else {
            0
        };

        let mut tx = self.pool.begin().await?;

        PaymentHistory::append(
            &mut *tx,
            NewPaymentRecord {
                user_id: user.id,
                stripe_session_id: Some(session.id.to_string()),
                stripe_subscription_id: stripe_subscription
                    .as_ref()
                    .map(|subscription| subscription.id.to_string()),
                amount,
                status: PaymentStatus::Completed,
                payment_type: if is_subscription {
                    PaymentType::Subscription
                } else {
                    PaymentType::OneTime
                },
                referral_id: referral_id.clone(),
            },
        )
        .await?;

        if let Some(subscription) = &stripe_subscription {
            self.subscriptions
                .sync_from_stripe(&mut tx, user.id, subscription)
                .await?;
        }

        if credits_to_add > 0 {
            let balance = CreditLedger::grant(&mut *tx, user.id, credits_to_add).await?;
            tracing::info!(
                user_id = %user.id,
                session_id = %session.id,
                credits_added = credits_to_add,
                balance = balance,
                "One-time purchase credits granted"
            );
        }

        tx.commit().await?;

        if let Some(referral_id) = referral_id {
            self.referral
                .notify(Conversion {
                    referral_id,
                    session_id: session.id.to_string(),
                    amount,
                    user_id: user.id,
                    email: Some(user.email),
                    is_subscription,
                })
                .await;
        }

        Ok(())
    }

    /// checkout.session.async_payment_failed
    async fn handle_async_payment_failed(&self, session: CheckoutSession) -> BillingResult<()> {
        if session.customer.is_none() && session.customer_email.is_none() {
            tracing::warn!(session_id = %session.id, "Checkout session missing customer details");
            return Ok(());
        }

        let user = match self.resolve_session_user(&session).await? {
            Some(user) => user,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    "No local user for failed checkout session, skipping"
                );
                return Ok(());
            }
        };

        let subscription_id = session.subscription.as_ref().map(expandable_subscription_id);

        let mut tx = self.pool.begin().await?;
        PaymentHistory::append(
            &mut *tx,
            NewPaymentRecord {
                user_id: user.id,
                stripe_session_id: Some(session.id.to_string()),
                stripe_subscription_id: subscription_id.clone(),
                amount: session.amount_total.unwrap_or(0),
                status: PaymentStatus::Failed,
                payment_type: if subscription_id.is_some() {
                    PaymentType::Subscription
                } else {
                    PaymentType::OneTime
                },
                referral_id: None,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::warn!(
            user_id = %user.id,
            session_id = %session.id,
            "Async payment failed"
        );

        Ok(())
    }

    /// customer.subscription.created / customer.subscription.updated
    async fn handle_subscription_updated(&self, subscription: Subscription) -> BillingResult<()> {
        let user = match self.find_user_for_customer(&subscription.customer).await? {
            Some(user) => user,
            None => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    "No local user for subscription customer, skipping"
                );
                return Ok(());
            }
        };

        let mut tx = self.pool.begin().await?;
        self.subscriptions
            .sync_from_stripe(&mut tx, user.id, &subscription)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    /// customer.subscription.deleted
    ///
    /// The row is kept (a canceled subscription still grants entitlement
    /// until its end date); only status and end date change.
    async fn handle_subscription_deleted(&self, subscription: Subscription) -> BillingResult<()> {
        let end_date = subscription
            .canceled_at
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        let rows =
            SubscriptionService::mark_canceled(&self.pool, subscription.id.as_str(), end_date)
                .await?;

        if rows == 0 {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription deleted for unknown local subscription, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            subscription_id = %subscription.id,
            end_date = %end_date,
            "Subscription cancelled"
        );

        Ok(())
    }

    /// invoice.payment_succeeded
    ///
    /// Renewal: appends the payment and extends the validity window.
    /// Credit allotments are not re-run here (see DESIGN.md).
    async fn handle_invoice_payment_succeeded(&self, invoice: Invoice) -> BillingResult<()> {
        let subscription_id = match invoice.subscription.as_ref() {
            Some(subscription) => expandable_subscription_id(subscription),
            None => return Ok(()),
        };

        let local = match SubscriptionService::find_by_stripe_id(&self.pool, &subscription_id)
            .await?
        {
            Some(record) => record,
            None => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    invoice_id = %invoice.id,
                    "Invoice paid for unknown local subscription, skipping"
                );
                return Ok(());
            }
        };

        let period_end = invoice
            .lines
            .as_ref()
            .and_then(|lines| lines.data.first())
            .and_then(|line| line.period.as_ref())
            .and_then(|period| period.end)
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        let mut tx = self.pool.begin().await?;

        PaymentHistory::append(
            &mut *tx,
            NewPaymentRecord {
                user_id: local.user_id,
                stripe_session_id: None,
                stripe_subscription_id: Some(subscription_id.clone()),
                amount: invoice.amount_paid.unwrap_or(0),
                status: PaymentStatus::Completed,
                payment_type: PaymentType::Subscription,
                referral_id: None,
            },
        )
        .await?;

        if let Some(end_date) = period_end {
            SubscriptionService::extend_period(&mut *tx, &subscription_id, end_date).await?;
        }

        tx.commit().await?;

        tracing::info!(
            user_id = %local.user_id,
            subscription_id = %subscription_id,
            amount = invoice.amount_paid.unwrap_or(0),
            "Invoice payment recorded"
        );

        Ok(())
    }

    /// invoice.payment_failed
    ///
    /// Appends the failed attempt; repeated failures past the threshold
    /// mark the subscription past due.
    async fn handle_invoice_payment_failed(&self, invoice: Invoice) -> BillingResult<()> {
        let subscription_id = match invoice.subscription.as_ref() {
            Some(subscription) => expandable_subscription_id(subscription),
            None => return Ok(()),
        };

        let local = match SubscriptionService::find_by_stripe_id(&self.pool, &subscription_id)
            .await?
        {
            Some(record) => record,
            None => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    invoice_id = %invoice.id,
                    "Invoice failed for unknown local subscription, skipping"
                );
                return Ok(());
            }
        };

        let attempt_count = invoice.attempt_count.unwrap_or(0);

        let mut tx = self.pool.begin().await?;

        PaymentHistory::append(
            &mut *tx,
            NewPaymentRecord {
                user_id: local.user_id,
                stripe_session_id: None,
                stripe_subscription_id: Some(subscription_id.clone()),
                amount: invoice.amount_due.unwrap_or(0),
                status: PaymentStatus::Failed,
                payment_type: PaymentType::Subscription,
                referral_id: None,
            },
        )
        .await?;

        if attempt_count > INVOICE_FAILURE_THRESHOLD {
            SubscriptionService::mark_past_due(&mut *tx, &subscription_id).await?;
            tracing::warn!(
                user_id = %local.user_id,
                subscription_id = %subscription_id,
                attempt_count = attempt_count,
                "Subscription marked past due after repeated payment failures"
            );
        }

        tx.commit().await?;

        tracing::warn!(
            user_id = %local.user_id,
            subscription_id = %subscription_id,
            attempt_count = attempt_count,
            "Invoice payment failed"
        );

        Ok(())
    }

    /// Match a checkout session to a local user, by session email first,
    /// then by the Stripe customer's email.
    async fn resolve_session_user(
        &self,
        session: &CheckoutSession,
    ) -> BillingResult<Option<UserRef>> {
        if let Some(email) = &session.customer_email {
            return self.find_user_by_email(email).await;
        }

        match &session.customer {
            Some(customer) => self.find_user_for_customer(customer).await,
            None => Ok(None),
        }
    }

    /// Match a Stripe customer to a local user via its email address.
    async fn find_user_for_customer(
        &self,
        customer: &Expandable<Customer>,
    ) -> BillingResult<Option<UserRef>> {
        let email = match customer {
            Expandable::Object(customer) if customer.deleted => {
                tracing::warn!(customer_id = %customer.id, "Stripe customer has been deleted");
                return Ok(None);
            }
            Expandable::Object(customer) => customer.email.clone(),
            Expandable::Id(id) => {
                let customer = Customer::retrieve(self.stripe.inner(), id, &[]).await?;
                if customer.deleted {
                    tracing::warn!(customer_id = %id, "Stripe customer has been deleted");
                    return Ok(None);
                }
                customer.email
            }
        };

        match email {
            Some(email) => self.find_user_by_email(&email).await,
            None => {
                tracing::warn!("Stripe customer has no email address");
                Ok(None)
            }
        }
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<UserRef>> {
        let row: Option<(Uuid, String)> =
            sqlx::query_as("SELECT id, email FROM users WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, email)| UserRef { id, email }))
    }
}

/// Manual verification of the `t=...,v1=...` signature header: HMAC-SHA256
/// over `"{timestamp}.{payload}"` with the webhook secret, within the
/// timestamp tolerance. Used when the stripe crate's own verifier rejects
/// a payload from a newer API version.
pub(crate) fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| {
            tracing::error!("System time error: {}", e);
            BillingError::WebhookSignatureInvalid
        })?
        .as_secs() as i64;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material.
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

fn extract_session(event: Event) -> BillingResult<CheckoutSession> {
    match event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected CheckoutSession".to_string(),
        )),
    }
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn expandable_subscription_id(subscription: &Expandable<Subscription>) -> String {
    match subscription {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(subscription) => subscription.id.to_string(),
    }
}
