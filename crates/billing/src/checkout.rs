//! One-time purchase fulfillment
//!
//! Works out how many credits a completed one-time checkout session is
//! worth. Resolution order: the legacy fixed price table, then per-line
//! product metadata, then a name-based fallback for credit packs created
//! without metadata.

use stripe::{CheckoutSession, CheckoutSessionItem, Expandable, Product};

use crate::client::StripeClient;
use crate::error::BillingResult;

/// Legacy price points sold before products carried a `credits` metadata
/// field. Amounts are minor currency units.
pub fn credits_for_amount(amount_total: i64) -> i64 {
    match amount_total {
        // AgentWrite single run: $5.00
        500 => 5,
        // PodScribe single episode: $7.00
        700 => 1,
        // Credit packs: $15 / $30 / $50
        1500 => 20,
        3000 => 50,
        5000 => 100,
        _ => 0,
    }
}

/// Resolves credit grants for completed one-time checkout sessions.
pub struct CheckoutFulfillment {
    stripe: StripeClient,
}

impl CheckoutFulfillment {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Credits owed for a completed one-time session. Zero means no grant
    /// and is not an error.
    pub async fn resolve_credits(&self, session: &CheckoutSession) -> BillingResult<i64> {
        let legacy = credits_for_amount(session.amount_total.unwrap_or(0));
        if legacy > 0 {
            return Ok(legacy);
        }

        // The webhook payload doesn't carry line items; re-fetch the
        // session with them expanded.
        let expanded =
            CheckoutSession::retrieve(self.stripe.inner(), &session.id, &["line_items"]).await?;

        let line_items = match &expanded.line_items {
            Some(list) => &list.data,
            None => return Ok(0),
        };

        let mut credits = 0i64;
        for item in line_items {
            credits += self.credits_for_line_item(item).await?;
        }

        Ok(credits)
    }

    async fn credits_for_line_item(&self, item: &CheckoutSessionItem) -> BillingResult<i64> {
        let product_id = match item.price.as_ref().and_then(|price| price.product.as_ref()) {
            Some(Expandable::Id(id)) => id.clone(),
            Some(Expandable::Object(product)) => product.id.clone(),
            None => return Ok(0),
        };

        let product = Product::retrieve(self.stripe.inner(), &product_id, &[]).await?;

        let metadata_credits = product
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("credits"))
            .and_then(|value| value.parse::<i64>().ok());

        if let Some(per_unit) = metadata_credits {
            let quantity = item.quantity.unwrap_or(1) as i64;
            return Ok(per_unit.max(0) * quantity);
        }

        // Credit packs predating the metadata convention: $1 buys 1 credit.
        let name_mentions_credit = product
            .name
            .as_deref()
            .map(|name| name.to_lowercase().contains("credit"))
            .unwrap_or(false);

        if name_mentions_credit {
            tracing::warn!(
                product_id = %product.id,
                "Product has no credits metadata, falling back to amount heuristic"
            );
            let amount_paid = item
                .price
                .as_ref()
                .and_then(|price| price.unit_amount)
                .unwrap_or(0)
                * item.quantity.unwrap_or(1) as i64;
            return Ok(amount_paid / 100);
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_amount_table() {
        assert_eq!(credits_for_amount(500), 5);
        assert_eq!(credits_for_amount(700), 1);
        assert_eq!(credits_for_amount(1500), 20);
        assert_eq!(credits_for_amount(3000), 50);
        assert_eq!(credits_for_amount(5000), 100);
    }

    #[test]
    fn test_unknown_amounts_resolve_to_zero() {
        assert_eq!(credits_for_amount(0), 0);
        assert_eq!(credits_for_amount(499), 0);
        assert_eq!(credits_for_amount(501), 0);
        assert_eq!(credits_for_amount(100_000), 0);
        assert_eq!(credits_for_amount(-500), 0);
    }
}
