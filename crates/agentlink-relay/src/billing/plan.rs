//! Plan allowances.

use crate::storage::Account;

/// Subscription statuses that keep a pro plan's benefits.
pub const PRO_ACTIVE_STATUSES: &[&str] = &["active", "trialing", "past_due"];

/// Whether a plan/status combination grants pro benefits.
pub fn is_pro_active(plan: &str, status: Option<&str>) -> bool {
    plan == "pro" && status.is_some_and(|s| PRO_ACTIVE_STATUSES.contains(&s))
}

/// How many distinct agents the account may pair. `None` means unlimited.
pub fn agent_allowance(account: &Account, free_limit: i64) -> Option<i64> {
    if is_pro_active(&account.plan, account.subscription_status.as_deref()) {
        None
    } else {
        Some(free_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(plan: &str, status: Option<&str>) -> Account {
        Account {
            id: "acc1".into(),
            email: "a@example.com".into(),
            provider: "google".into(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            plan: plan.into(),
            subscription_status: status.map(str::to_string),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn free_plan_is_limited() {
        assert_eq!(agent_allowance(&account("free", None), 1), Some(1));
        assert_eq!(
            agent_allowance(&account("free", Some("active")), 1),
            Some(1)
        );
    }

    #[test]
    fn pro_plan_unlimited_while_status_good() {
        for status in ["active", "trialing", "past_due"] {
            assert_eq!(agent_allowance(&account("pro", Some(status)), 1), None);
        }
    }

    #[test]
    fn lapsed_pro_falls_back_to_limit() {
        assert_eq!(
            agent_allowance(&account("pro", Some("canceled")), 1),
            Some(1)
        );
        assert_eq!(agent_allowance(&account("pro", None), 1), Some(1));
    }
}
