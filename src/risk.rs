// =============================================================================
// Risk Gate
// =============================================================================
//
// Per-subscription sequential fail-fast gate: evaluate conditions in a
// fixed order and return the first violation rather than collecting all
// of them. Checks run daily-loss-cap -> max-positions -> direction-blocked.

use rust_decimal::Decimal;

use crate::errors::EngineError;
use crate::types::{Action, AllowedDirections, Subscription};

/// Evaluate the risk gate for `sub` against an incoming `action`. Returns
/// `Ok(())` if the signal may proceed to execution, or the first
/// `EngineError` violated otherwise.
pub fn check(sub: &Subscription, allowed: AllowedDirections, action: Action) -> Result<(), EngineError> {
    if sub.counters.current_daily_loss_usd >= sub.risk.max_daily_loss_usd {
        return Err(EngineError::DailyLossCap);
    }

    if action != Action::Close && sub.counters.current_positions >= sub.risk.max_concurrent_positions {
        return Err(EngineError::MaxPositions);
    }

    if direction_blocked(allowed, action) {
        return Err(EngineError::DirectionBlocked);
    }

    Ok(())
}

fn direction_blocked(allowed: AllowedDirections, action: Action) -> bool {
    match (allowed, action) {
        (AllowedDirections::Both, _) => false,
        (_, Action::Close) => false,
        (AllowedDirections::BuyOnly, Action::Sell) => true,
        (AllowedDirections::SellOnly, Action::Buy) => true,
        _ => false,
    }
}

/// Remaining daily-loss headroom, used by `execution.rs` to clamp position
/// size so a single trade can't blow through the cap in one shot.
pub fn remaining_daily_loss_budget(sub: &Subscription) -> Decimal {
    (sub.risk.max_daily_loss_usd - sub.counters.current_daily_loss_usd).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sample_sub(daily_loss: Decimal, cap: Decimal, positions: u32, max_positions: u32) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            exchange_account_id: Uuid::new_v4(),
            status: crate::types::SubscriptionStatus::Active,
            overrides: Default::default(),
            risk: crate::types::SubscriptionRisk {
                max_daily_loss_usd: cap,
                max_concurrent_positions: max_positions,
            },
            counters: crate::types::SubscriptionCounters {
                current_daily_loss_usd: daily_loss,
                current_positions: positions,
                ..Default::default()
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn daily_loss_cap_checked_first() {
        let sub = sample_sub(dec!(100), dec!(100), 5, 3);
        assert!(matches!(
            check(&sub, AllowedDirections::Both, Action::Buy),
            Err(EngineError::DailyLossCap)
        ));
    }

    #[test]
    fn max_positions_checked_before_direction() {
        let sub = sample_sub(dec!(0), dec!(100), 3, 3);
        assert!(matches!(
            check(&sub, AllowedDirections::BuyOnly, Action::Sell),
            Err(EngineError::MaxPositions)
        ));
    }

    #[test]
    fn direction_blocked_when_bot_restricts_to_buy_only() {
        let sub = sample_sub(dec!(0), dec!(100), 0, 3);
        assert!(matches!(
            check(&sub, AllowedDirections::BuyOnly, Action::Sell),
            Err(EngineError::DirectionBlocked)
        ));
    }

    #[test]
    fn close_action_never_blocked_by_positions_or_direction() {
        let sub = sample_sub(dec!(0), dec!(100), 3, 3);
        assert!(check(&sub, AllowedDirections::BuyOnly, Action::Close).is_ok());
    }

    #[test]
    fn passes_when_all_gates_clear() {
        let sub = sample_sub(dec!(0), dec!(100), 0, 3);
        assert!(check(&sub, AllowedDirections::Both, Action::Buy).is_ok());
    }

    #[test]
    fn remaining_budget_never_negative() {
        let sub = sample_sub(dec!(150), dec!(100), 0, 3);
        assert_eq!(remaining_daily_loss_budget(&sub), Decimal::ZERO);
    }
}
