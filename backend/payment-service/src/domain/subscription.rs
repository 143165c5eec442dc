use super::string_enum;
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

string_enum!(BillingCycle, "billing cycle", {
    Monthly => "monthly",
    Yearly => "yearly",
});

impl BillingCycle {
    /// Advance `from` by one cycle. Month ends clamp (Jan 31 → Feb 28/29).
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        };
        from.checked_add_months(Months::new(months))
            .unwrap_or_else(|| from + Duration::days(if months == 1 { 30 } else { 365 }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Suspended,
    Cancelled,
}

string_enum!(SubscriptionStatus, "subscription status", {
    Trial => "trial",
    Active => "active",
    Suspended => "suspended",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub fan_id: Uuid,
    pub creator_id: Uuid,
    pub price: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    pub processor: String,
    pub processor_subscription_id: Option<String>,
    pub payment_method_id: Option<Uuid>,
    /// Renewal charge whose period this row reflects
    pub last_renewal_id: Option<Uuid>,
    /// Optimistic concurrency token, bumped on every update
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Access summary for one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionAccess {
    pub subscription_id: Uuid,
    pub status: SubscriptionStatus,
    pub has_access: bool,
    pub auto_renew: bool,
    pub in_trial: bool,
    pub trial_end: Option<DateTime<Utc>>,
    pub current_period_end: DateTime<Utc>,
    /// Whole days left in the current period
    pub days_remaining: i64,
}

impl Subscription {
    /// Deferred cancellation whose period has run out, before the sweep
    /// has flipped the stored status.
    pub fn is_logically_cancelled(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Cancelled
            || (!self.auto_renew && self.current_period_end <= now)
    }

    /// Whether the fan currently has access to the creator's content
    pub fn grants_access(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Trial | SubscriptionStatus::Active
        ) && self.current_period_end > now
    }

    /// What the fan can see right now; a deferred cancellation past its
    /// period end already reads as cancelled
    pub fn access(&self, now: DateTime<Utc>) -> SubscriptionAccess {
        let status = if self.is_logically_cancelled(now) {
            SubscriptionStatus::Cancelled
        } else {
            self.status
        };
        SubscriptionAccess {
            subscription_id: self.id,
            status,
            has_access: self.grants_access(now),
            auto_renew: self.auto_renew,
            in_trial: self.status == SubscriptionStatus::Trial
                && self.trial_end.is_some_and(|end| end > now),
            trial_end: self.trial_end,
            current_period_end: self.current_period_end,
            days_remaining: (self.current_period_end - now).num_days().max(0),
        }
    }

    /// Next period for a renewal charge: one cycle from the current end,
    /// or from `now` when that would already be in the past.
    pub fn next_period(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let extended = self.billing_cycle.advance(self.current_period_end);
        if extended > now {
            (self.current_period_end, extended)
        } else {
            (now, self.billing_cycle.advance(now))
        }
    }
}
