// =============================================================================
// Trade Tracker — sole serial writer for trade close-state
// =============================================================================
//
// Every path that can close a trade (the SL/TP monitor, the scheduler's
// ghost-trade sweep, a manual close) funnels through `close_trade` here
// rather than writing to the `trades` table directly. A `tokio::Mutex`
// serializes the read-modify-write so two concurrent closers racing on the
// same trade id can't both compute P&L and double-count counters; the
// underlying `close_trade` SQL is also guarded by `WHERE status = 'open'`
// as a second line of defense, but the counter/notification side effects
// here are not idempotent and must not run twice.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::execution::cancel_opposite_leg;
use crate::types::{ExitReason, Notification, NotificationType, Trade};

pub struct TradeTracker {
    write_lock: Mutex<()>,
}

impl TradeTracker {
    pub fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
        }
    }

    /// Close `trade` at `exit_price`, cancel its paired protective leg
    /// best-effort, update the owning subscription's rolling counters, roll
    /// the daily P&L snapshot, and emit a notification. Returns `true` if
    /// this call performed the close, `false` if the trade was already
    /// closed by a concurrent caller.
    #[instrument(skip(self, state, trade), fields(trade_id = %trade.id))]
    pub async fn close_trade(
        &self,
        state: &Arc<AppState>,
        trade: &Trade,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> anyhow::Result<bool> {
        let _guard = self.write_lock.lock().await;

        let pnl_usd = compute_pnl(trade, exit_price);
        let pnl_pct = if trade.entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (pnl_usd / (trade.entry_price * trade.entry_quantity)) * Decimal::from(100)
        };

        let affected = state
            .db
            .close_trade(trade.id, exit_price, trade.entry_quantity, reason, pnl_usd, pnl_pct)
            .await?;

        if affected == 0 {
            // Another caller already closed this trade between our read and
            // this write; nothing left to do.
            return Ok(false);
        }

        let venue = state
            .db
            .get_exchange_account(trade.exchange_account_id)
            .await?
            .map(|account| account.venue);
        if let Some(adapter) = venue.and_then(|v| state.exchange_registry.get(v)) {
            let opposite_leg = match reason {
                ExitReason::StopLoss => trade.tp_order_id.as_deref(),
                ExitReason::TakeProfit => trade.sl_order_id.as_deref(),
                _ => None,
            };
            cancel_opposite_leg(&adapter, &trade.symbol, opposite_leg).await;
        }

        if let Some(mut sub) = state.db.get_subscription(trade.subscription_id).await? {
            sub.counters.current_positions = sub.counters.current_positions.saturating_sub(1);
            sub.counters.total_pnl_usd += pnl_usd;
            sub.counters.current_daily_loss_usd = (sub.counters.current_daily_loss_usd - pnl_usd).max(Decimal::ZERO);
            if pnl_usd.is_sign_positive() {
                sub.counters.win_count += 1;
            } else {
                sub.counters.loss_count += 1;
            }
            state.db.apply_subscription_counters(&sub).await?;
            self.roll_daily_snapshot(state, &sub, pnl_usd, pnl_usd.is_sign_positive()).await?;

            let notification = Notification {
                id: Uuid::new_v4(),
                user_id: sub.user_id,
                kind: if pnl_usd.is_sign_positive() {
                    NotificationType::Success
                } else {
                    NotificationType::Warning
                },
                category: "trade_closed".to_string(),
                title: format!("{} closed", trade.symbol),
                message: format!("{} closed via {reason} with P&L {pnl_usd} USD", trade.symbol),
                metadata: None,
                created_at: Utc::now(),
            };
            state.db.insert_notification(&notification).await?;
        }

        state.increment_version();
        info!(trade_id = %trade.id, %reason, %pnl_usd, "trade closed");
        Ok(true)
    }

    async fn roll_daily_snapshot(
        &self,
        state: &Arc<AppState>,
        sub: &crate::types::Subscription,
        pnl_usd: Decimal,
        is_win: bool,
    ) -> anyhow::Result<()> {
        let today: NaiveDate = Utc::now().date_naive();
        let snapshot = crate::types::DailyPnlSnapshot {
            subscription_id: sub.id,
            user_id: sub.user_id,
            bot_id: sub.bot_id,
            snapshot_date: today,
            daily_pnl_usd: pnl_usd,
            cumulative_pnl_usd: sub.counters.total_pnl_usd,
            daily_wins: is_win as u32,
            daily_losses: (!is_win) as u32,
            cumulative_wins: sub.counters.win_count,
            cumulative_losses: sub.counters.loss_count,
            win_rate_pct: win_rate_pct(sub.counters.win_count, sub.counters.loss_count),
        };
        state.db.upsert_daily_snapshot(&snapshot).await
    }
}

impl Default for TradeTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn win_rate_pct(wins: u32, losses: u32) -> Decimal {
    let total = wins + losses;
    if total == 0 {
        return Decimal::ZERO;
    }
    Decimal::from(wins) * Decimal::from(100) / Decimal::from(total)
}

fn compute_pnl(trade: &Trade, exit_price: Decimal) -> Decimal {
    let delta = match trade.direction {
        crate::types::Direction::Long => exit_price - trade.entry_price,
        crate::types::Direction::Short => trade.entry_price - exit_price,
    };
    delta * trade.entry_quantity
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sample_trade(direction: crate::types::Direction, entry: Decimal, qty: Decimal) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            signal_execution_id: None,
            exchange_account_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            side: crate::types::Side::Buy,
            direction,
            entry_price: entry,
            entry_quantity: qty,
            entry_time: Utc::now(),
            sl_order_id: None,
            tp_order_id: None,
            exit_price: None,
            exit_quantity: None,
            exit_time: None,
            exit_reason: None,
            pnl_usd: None,
            pnl_pct: None,
            is_winner: None,
            status: crate::types::TradeStatus::Open,
        }
    }

    #[test]
    fn pnl_positive_for_long_on_price_increase() {
        let trade = sample_trade(crate::types::Direction::Long, dec!(100), dec!(2));
        assert_eq!(compute_pnl(&trade, dec!(110)), dec!(20));
    }

    #[test]
    fn pnl_positive_for_short_on_price_decrease() {
        let trade = sample_trade(crate::types::Direction::Short, dec!(100), dec!(2));
        assert_eq!(compute_pnl(&trade, dec!(90)), dec!(20));
    }

    #[test]
    fn win_rate_is_zero_with_no_trades() {
        assert_eq!(win_rate_pct(0, 0), Decimal::ZERO);
    }

    #[test]
    fn win_rate_rounds_to_expected_fraction() {
        assert_eq!(win_rate_pct(3, 1), dec!(75));
    }
}
