//! Affiliate conversion tracking
//!
//! Fire-and-forget notification to the Rewardful API after a paid
//! conversion. This is a best-effort side channel: it runs after the
//! primary transaction has committed and no failure here may surface as a
//! webhook-processing failure.

use serde::Serialize;
use uuid::Uuid;

/// A paid conversion to report.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub referral_id: String,
    /// Checkout session id, used as the order id for dedup on their side.
    pub session_id: String,
    /// Minor currency units.
    pub amount: i64,
    pub user_id: Uuid,
    pub email: Option<String>,
    pub is_subscription: bool,
}

#[derive(Debug, Serialize)]
struct ConversionPayload<'a> {
    referral: &'a str,
    customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_email: Option<&'a str>,
    /// Major currency units.
    value: f64,
    currency: &'static str,
    order_id: &'a str,
    first_order: bool,
    status: &'static str,
    meta: ConversionMeta,
}

#[derive(Debug, Serialize)]
struct ConversionMeta {
    #[serde(rename = "type")]
    conversion_type: &'static str,
}

/// Client for the affiliate-tracking API.
#[derive(Clone)]
pub struct ReferralTracker {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl ReferralTracker {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(api_key, "https://api.rewardful.com".to_string())
    }

    /// Point the tracker at a different endpoint (tests).
    pub fn with_base_url(api_key: Option<String>, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    /// Report a conversion. Never fails: every error is logged and
    /// swallowed so affiliate tracking cannot break payment processing.
    pub async fn notify(&self, conversion: Conversion) {
        match self.try_notify(&conversion).await {
            Ok(true) => {
                tracing::info!(
                    referral_id = %conversion.referral_id,
                    session_id = %conversion.session_id,
                    "Referral conversion tracked"
                );
            }
            Ok(false) => {
                tracing::debug!(
                    referral_id = %conversion.referral_id,
                    "Referral tracking skipped (no API key configured)"
                );
            }
            Err(error) => {
                tracing::error!(
                    referral_id = %conversion.referral_id,
                    session_id = %conversion.session_id,
                    error = %error,
                    "Referral conversion tracking failed"
                );
            }
        }
    }

    async fn try_notify(&self, conversion: &Conversion) -> Result<bool, reqwest::Error> {
        let api_key = match &self.api_key {
            Some(key) => key,
            None => return Ok(false),
        };

        let payload = ConversionPayload {
            referral: &conversion.referral_id,
            customer_id: conversion.user_id.to_string(),
            customer_email: conversion.email.as_deref(),
            value: conversion.amount as f64 / 100.0,
            currency: "USD",
            order_id: &conversion.session_id,
            first_order: true,
            status: "paid",
            meta: ConversionMeta {
                conversion_type: if conversion.is_subscription {
                    "subscription"
                } else {
                    "one-time"
                },
            },
        };

        self.http
            .post(format!("{}/v1/conversions", self.base_url))
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversion() -> Conversion {
        Conversion {
            referral_id: "ref_abc".to_string(),
            session_id: "cs_test_123".to_string(),
            amount: 1500,
            user_id: Uuid::new_v4(),
            email: Some("buyer@example.com".to_string()),
            is_subscription: false,
        }
    }

    #[tokio::test]
    async fn test_notify_posts_conversion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/conversions")
            .match_header("authorization", "Bearer rk_test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "referral": "ref_abc",
                "order_id": "cs_test_123",
                "value": 15.0,
                "status": "paid",
                "meta": { "type": "one-time" },
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let tracker =
            ReferralTracker::with_base_url(Some("rk_test".to_string()), server.url());
        tracker.notify(conversion()).await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_swallows_http_failures() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/conversions")
            .with_status(500)
            .create_async()
            .await;

        let tracker =
            ReferralTracker::with_base_url(Some("rk_test".to_string()), server.url());
        // Must return (), not panic or propagate.
        tracker.notify(conversion()).await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_without_api_key_is_a_noop() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/conversions")
            .expect(0)
            .create_async()
            .await;

        let tracker = ReferralTracker::with_base_url(None, server.url());
        tracker.notify(conversion()).await;

        mock.assert_async().await;
    }
}
