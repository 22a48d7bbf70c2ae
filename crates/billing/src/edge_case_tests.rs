// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions in:
//! - Webhook signature verification (WH-01 to WH-06)
//! - Plan resolution and allotments (PL-01 to PL-03)

#[cfg(test)]
mod webhook_signature_tests {
    use crate::error::BillingError;
    use crate::webhooks::verify_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const SECRET: &str = "whsec_test_secret_key_for_unit_tests";

    /// Sign `payload` the way Stripe does: HMAC-SHA256 over
    /// "{timestamp}.{payload}" with the un-prefixed secret.
    fn sign(payload: &str, timestamp: i64) -> String {
        let key = SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    // =========================================================================
    // WH-01: Correctly signed current payload - accepted
    // =========================================================================
    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1","type":"payment_method.attached"}"#;
        let ts = now();
        let header = format!("t={},v1={}", ts, sign(payload, ts));

        assert!(verify_signature(payload, &header, SECRET).is_ok());
    }

    // =========================================================================
    // WH-02: Payload tampered after signing - rejected
    // =========================================================================
    #[test]
    fn test_tampered_payload_rejected() {
        let payload = r#"{"id":"evt_1","amount":500}"#;
        let ts = now();
        let header = format!("t={},v1={}", ts, sign(payload, ts));

        let tampered = r#"{"id":"evt_1","amount":999500}"#;
        let err = verify_signature(tampered, &header, SECRET).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    // =========================================================================
    // WH-03: Timestamp outside the 5 minute tolerance - rejected even when
    // the signature itself is valid
    // =========================================================================
    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let ts = now() - 301;
        let header = format!("t={},v1={}", ts, sign(payload, ts));

        let err = verify_signature(payload, &header, SECRET).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    // =========================================================================
    // WH-04: Header missing the timestamp component - rejected
    // =========================================================================
    #[test]
    fn test_missing_timestamp_rejected() {
        let payload = "{}";
        let header = format!("v1={}", sign(payload, now()));

        let err = verify_signature(payload, &header, SECRET).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    // =========================================================================
    // WH-05: Header missing the v1 component - rejected
    // =========================================================================
    #[test]
    fn test_missing_v1_rejected() {
        let header = format!("t={}", now());

        let err = verify_signature("{}", &header, SECRET).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    // =========================================================================
    // WH-06: Garbage header - rejected, not panicked
    // =========================================================================
    #[test]
    fn test_garbage_header_rejected() {
        for header in ["", "t=abc,v1=", "=,=,=", "t=,v1=deadbeef"] {
            let err = verify_signature("{}", header, SECRET).unwrap_err();
            assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        }
    }
}

#[cfg(test)]
mod plan_allotment_tests {
    use crate::client::PriceIds;
    use crate::plans;
    use ghosttools_shared::{PlanId, STARTER_PLAN_CREDITS, UNLIMITED_CREDITS};

    fn price_ids() -> PriceIds {
        PriceIds {
            starter: "price_starter".to_string(),
            pro: "price_pro".to_string(),
        }
    }

    // =========================================================================
    // PL-01: Starter price resolves to the fixed 20-credit allotment
    // =========================================================================
    #[test]
    fn test_starter_price_grants_fixed_allotment() {
        let plan = plans::resolve(&price_ids(), "price_starter");
        assert_eq!(plan, PlanId::Starter);
        assert_eq!(plan.credit_allotment(), STARTER_PLAN_CREDITS);
    }

    // =========================================================================
    // PL-02: Pro price resolves to the unlimited sentinel
    // =========================================================================
    #[test]
    fn test_pro_price_grants_unlimited_sentinel() {
        let plan = plans::resolve(&price_ids(), "price_pro");
        assert_eq!(plan, PlanId::Pro);
        assert_eq!(plan.credit_allotment(), UNLIMITED_CREDITS);
    }

    // =========================================================================
    // PL-03: Unknown prices resolve to custom, which never writes the ledger
    // =========================================================================
    #[test]
    fn test_custom_plan_has_no_allotment() {
        let plan = plans::resolve(&price_ids(), "price_enterprise_bespoke");
        assert_eq!(plan, PlanId::Custom);
        assert_eq!(plan.credit_allotment(), 0);
    }
}
