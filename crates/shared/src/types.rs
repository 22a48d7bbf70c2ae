//! Domain types shared across the GhostTools platform

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Sentinel balance standing in for "unlimited" on the pro plan.
/// The ledger stores a concrete number; the tool endpoints treat any
/// balance at or above this value as unmetered.
pub const UNLIMITED_CREDITS: i64 = 9999;

/// Monthly credit allotment for the starter plan.
pub const STARTER_PLAN_CREDITS: i64 = 20;

/// Subscription plan for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanId {
    Starter,
    Pro,
    /// Any price id we don't recognize maps here; no fixed allotment.
    Custom,
}

impl PlanId {
    /// Fixed monthly credit allotment, or 0 when the plan carries none.
    pub fn credit_allotment(&self) -> i64 {
        match self {
            Self::Starter => STARTER_PLAN_CREDITS,
            Self::Pro => UNLIMITED_CREDITS,
            Self::Custom => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Invalid plan id: {}", s)),
        }
    }
}

/// A user's subscription as mirrored from the payment provider.
/// Status is the provider-reported string passed through verbatim
/// ("active", "trialing", "canceled", "past_due", ...).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub status: String,
    pub plan_id: String,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Whether this row still grants entitlement: active, or canceled with
    /// paid-up time remaining.
    pub fn is_current(&self, now: OffsetDateTime) -> bool {
        self.status == "active" || (self.status == "canceled" && self.end_date > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use time::Duration;

    #[test]
    fn test_plan_allotments() {
        assert_eq!(PlanId::Starter.credit_allotment(), 20);
        assert_eq!(PlanId::Pro.credit_allotment(), UNLIMITED_CREDITS);
        assert_eq!(PlanId::Custom.credit_allotment(), 0);
    }

    #[test]
    fn test_plan_round_trip() {
        for plan in [PlanId::Starter, PlanId::Pro, PlanId::Custom] {
            assert_eq!(PlanId::from_str(plan.as_str()), Ok(plan));
        }
        assert!(PlanId::from_str("enterprise").is_err());
    }

    #[test]
    fn test_canceled_subscription_stays_current_until_period_end() {
        let now = OffsetDateTime::now_utc();
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            stripe_subscription_id: "sub_123".to_string(),
            status: "canceled".to_string(),
            plan_id: "starter".to_string(),
            start_date: now - Duration::days(20),
            end_date: now + Duration::days(10),
            created_at: now - Duration::days(20),
            updated_at: now,
        };
        assert!(record.is_current(now));
        assert!(!record.is_current(now + Duration::days(11)));

        let lapsed = SubscriptionRecord {
            status: "past_due".to_string(),
            ..record
        };
        assert!(!lapsed.is_current(now));
    }
}
