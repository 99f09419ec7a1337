// =============================================================================
// Signal execution pipeline — glue between broadcast, risk, execution and
// persistence for a single (signal, subscription) pair
// =============================================================================
//
// This is the per-subscriber unit of work `broadcast::execute_for_subscription`
// spawns. It owns the SignalExecution audit row from creation to completion:
// look up the bot and account, run the risk gate, place the order, persist
// the outcome, update the subscription's rolling counters, and record the
// opened trade.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::instrument;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::errors::EngineError;
use crate::execution;
use crate::risk;
use crate::types::{
    Action, Direction, Side, Signal, SignalExecution, SignalExecutionStatus, Subscription, Trade,
    TradeStatus,
};

#[instrument(skip(state, signal, sub), fields(subscription_id = %sub.id))]
pub async fn execute_signal_for_subscription(
    state: &Arc<AppState>,
    signal: &Signal,
    sub: &Subscription,
) -> anyhow::Result<SignalExecutionStatus> {
    let started = Instant::now();
    let execution_id = Uuid::new_v4();

    let bot = state
        .db
        .get_bot(sub.bot_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("bot {} referenced by subscription not found", sub.bot_id))?;

    let mut exec_row = SignalExecution {
        id: execution_id,
        signal_id: signal.id,
        subscription_id: sub.id,
        user_id: sub.user_id,
        exchange_account_id: sub.exchange_account_id,
        status: SignalExecutionStatus::Pending,
        exchange_order_id: None,
        executed_price: None,
        executed_quantity: None,
        sl_order_id: None,
        tp_order_id: None,
        sl_price: None,
        tp_price: None,
        sl_order_status: None,
        tp_order_status: None,
        realized_pnl: None,
        close_reason: None,
        error_message: None,
        error_code: None,
        execution_time_ms: 0,
        created_at: Utc::now(),
        completed_at: None,
    };
    state.db.insert_signal_execution(&exec_row).await?;

    if let Err(e) = risk::check(sub, bot.allowed_directions, signal.action) {
        return finish_skipped(state, &mut exec_row, started, e).await;
    }

    let account = state
        .db
        .get_exchange_account(sub.exchange_account_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("exchange account {} not found", sub.exchange_account_id))?;

    if !account.is_active {
        return finish_with_error(state, &mut exec_row, started, EngineError::WebhookInactive).await;
    }

    let adapter = match state.exchange_registry.get(account.venue) {
        Some(a) => a,
        None => {
            return finish_with_error(
                state,
                &mut exec_row,
                started,
                EngineError::SymbolInvalid(format!("no adapter registered for venue {}", account.venue)),
            )
            .await
        }
    };

    let position_mode = account.position_mode.unwrap_or_else(|| {
        state
            .credentials
            .cached_position_mode(account.id)
            .unwrap_or_default()
    });

    let side = match signal.action {
        Action::Buy => Side::Buy,
        Action::Sell => Side::Sell,
        Action::Close => {
            // Closing is handled by the monitor/trade tracker against an
            // existing open trade, not by opening a new position here.
            exec_row.status = SignalExecutionStatus::Skipped;
            exec_row.execution_time_ms = started.elapsed().as_millis() as u64;
            exec_row.completed_at = Some(Utc::now());
            state.db.complete_signal_execution(&exec_row).await?;
            return Ok(SignalExecutionStatus::Skipped);
        }
    };

    let leverage = sub.overrides.leverage.unwrap_or(bot.defaults.leverage);
    let margin_usd = sub.overrides.margin_usd.unwrap_or(bot.defaults.margin_usd);
    let sl_pct = sub.overrides.stop_loss_pct.unwrap_or(bot.defaults.stop_loss_pct);
    let tp_pct = sub.overrides.take_profit_pct.unwrap_or(bot.defaults.take_profit_pct);

    let symbol_info = match adapter.get_symbol_info(&signal.ticker).await {
        Ok(info) => info,
        Err(e) => {
            return finish_with_error(state, &mut exec_row, started, EngineError::Network(e.to_string())).await
        }
    };

    // Quantity sizing: margin * leverage / mark price, snapped down to the
    // venue's lot step. A decimal-exact calculation — no floats at this
    // boundary.
    let quantity = match execution::compute_quantity(margin_usd, leverage, symbol_info.mark_price, symbol_info.qty_step) {
        Some(q) => q,
        None => return finish_with_error(state, &mut exec_row, started, EngineError::QtyTooSmall).await,
    };

    let outcome = execution::execute_entry(
        adapter,
        &state.config.read().clone(),
        &signal.ticker,
        side,
        quantity,
        leverage,
        position_mode,
        sl_pct,
        tp_pct,
        symbol_info.mark_price,
    )
    .await;

    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => return finish_with_error(state, &mut exec_row, started, e).await,
    };

    exec_row.status = if outcome.protection_partial {
        SignalExecutionStatus::Failed
    } else {
        SignalExecutionStatus::Success
    };
    exec_row.exchange_order_id = Some(outcome.exchange_order_id.clone());
    exec_row.executed_price = outcome.executed_price;
    exec_row.executed_quantity = outcome.executed_quantity;
    exec_row.sl_order_id = outcome.sl_order_id.clone();
    exec_row.tp_order_id = outcome.tp_order_id.clone();
    exec_row.sl_price = Some(outcome.sl_price);
    exec_row.tp_price = Some(outcome.tp_price);
    if outcome.protection_partial {
        exec_row.error_code = Some(EngineError::SlTpPartial.code().to_string());
        exec_row.error_message = Some(EngineError::SlTpPartial.to_string());
    }
    exec_row.execution_time_ms = started.elapsed().as_millis() as u64;
    exec_row.completed_at = Some(Utc::now());
    state.db.complete_signal_execution(&exec_row).await?;

    let trade = Trade {
        id: Uuid::new_v4(),
        subscription_id: sub.id,
        user_id: sub.user_id,
        signal_execution_id: Some(execution_id),
        exchange_account_id: account.id,
        symbol: signal.ticker.clone(),
        side,
        direction: match side {
            Side::Buy => Direction::Long,
            Side::Sell => Direction::Short,
        },
        entry_price: outcome.executed_price.unwrap_or(Decimal::ZERO),
        entry_quantity: outcome.executed_quantity.unwrap_or(quantity),
        entry_time: Utc::now(),
        sl_order_id: outcome.sl_order_id,
        tp_order_id: outcome.tp_order_id,
        exit_price: None,
        exit_quantity: None,
        exit_time: None,
        exit_reason: None,
        pnl_usd: None,
        pnl_pct: None,
        is_winner: None,
        status: TradeStatus::Open,
    };
    state.db.insert_trade(&trade).await?;

    let mut updated_sub = sub.clone();
    updated_sub.counters.current_positions += 1;
    updated_sub.counters.total_signals_received += 1;
    updated_sub.counters.total_orders_executed += 1;
    state.db.apply_subscription_counters(&updated_sub).await?;

    Ok(exec_row.status)
}

async fn finish_with_error(
    state: &Arc<AppState>,
    exec_row: &mut SignalExecution,
    started: Instant,
    err: EngineError,
) -> anyhow::Result<SignalExecutionStatus> {
    exec_row.status = SignalExecutionStatus::Failed;
    exec_row.error_code = Some(err.code().to_string());
    exec_row.error_message = Some(err.to_string());
    exec_row.execution_time_ms = started.elapsed().as_millis() as u64;
    exec_row.completed_at = Some(Utc::now());
    state.db.complete_signal_execution(exec_row).await?;

    Ok(SignalExecutionStatus::Failed)
}

/// Risk-gate violations are an expected, operator-visible outcome rather
/// than a failure: the subscriber is skipped, not penalized, and no
/// exchange call is ever attempted.
async fn finish_skipped(
    state: &Arc<AppState>,
    exec_row: &mut SignalExecution,
    started: Instant,
    reason: EngineError,
) -> anyhow::Result<SignalExecutionStatus> {
    exec_row.status = SignalExecutionStatus::Skipped;
    exec_row.error_code = Some(reason.code().to_string());
    exec_row.error_message = Some(reason.to_string());
    exec_row.execution_time_ms = started.elapsed().as_millis() as u64;
    exec_row.completed_at = Some(Utc::now());
    state.db.complete_signal_execution(exec_row).await?;

    Ok(SignalExecutionStatus::Skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::app_state::ExchangeRegistry;
    use crate::config::RuntimeConfig;
    use crate::credentials::CredentialStore;
    use crate::db::PersistenceGateway;
    use crate::exchange::{EntryRequest, EntryResult, ExchangeAdapter, OrderAck, OrderStatus, SymbolInfo};
    use crate::types::{PositionMode, SubscriptionOverrides, SubscriptionRisk, Venue};

    /// Fills entries at the mark price it reports for `get_symbol_info`, so
    /// the quantity the pipeline computed can be read back off the fill.
    struct FakeAdapter {
        mark_price: Decimal,
        qty_step: Decimal,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeAdapter {
        fn venue(&self) -> Venue {
            Venue::A
        }

        fn places_protection_atomically(&self) -> bool {
            true
        }

        async fn probe_position_mode(&self) -> anyhow::Result<PositionMode> {
            Ok(PositionMode::OneWay)
        }

        async fn get_symbol_info(&self, _symbol: &str) -> anyhow::Result<SymbolInfo> {
            Ok(SymbolInfo {
                mark_price: self.mark_price,
                qty_step: self.qty_step,
            })
        }

        async fn open_position(&self, req: &EntryRequest) -> anyhow::Result<EntryResult> {
            Ok(EntryResult {
                entry: OrderAck {
                    exchange_order_id: "entry-1".to_string(),
                    avg_price: Some(self.mark_price),
                    filled_quantity: Some(req.quantity),
                },
                stop_loss_order_id: Some("sl-1".to_string()),
                take_profit_order_id: Some("tp-1".to_string()),
            })
        }

        async fn place_stop_loss(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: Decimal,
            _stop_price: Decimal,
            _position_mode: PositionMode,
        ) -> anyhow::Result<OrderAck> {
            unimplemented!("venue A places protection atomically")
        }

        async fn place_take_profit(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: Decimal,
            _trigger_price: Decimal,
            _position_mode: PositionMode,
        ) -> anyhow::Result<OrderAck> {
            unimplemented!("venue A places protection atomically")
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_order_status(&self, _symbol: &str, _order_id: &str) -> anyhow::Result<OrderStatus> {
            unimplemented!("not exercised by this test")
        }

        async fn get_open_order_ids(&self, _symbol: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    async fn seed(db: &PersistenceGateway) -> (crate::types::Signal, Subscription) {
        let user_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let sub_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();

        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, 'u@test', ?)")
            .bind(user_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO exchange_accounts (id, owner_user_id, venue, credentials, created_at)
             VALUES (?, ?, 'A', 'x', ?)",
        )
        .bind(account_id.to_string())
        .bind(user_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO bots (id, name, default_leverage, default_margin_usd, default_sl_pct,
                default_tp_pct, market_type, allowed_directions, created_at)
             VALUES (?, 'demo', 10, '100', '3', '5', 'futures', 'both', ?)",
        )
        .bind(bot_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO subscriptions (id, user_id, bot_id, exchange_account_id, status,
                max_daily_loss_usd, max_concurrent_positions, created_at)
             VALUES (?, ?, ?, ?, 'active', '100', 3, ?)",
        )
        .bind(sub_id.to_string())
        .bind(user_id.to_string())
        .bind(bot_id.to_string())
        .bind(account_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();

        let signal = crate::types::Signal {
            id: Uuid::new_v4(),
            bot_id,
            ticker: "BTCUSDT".to_string(),
            action: Action::Buy,
            source_ip: None,
            raw_payload: serde_json::json!({}),
            created_at: Utc::now(),
            completed_at: None,
            total_subscribers: None,
            successful_executions: None,
            failed_executions: None,
            broadcast_duration_ms: None,
        };
        let sub = Subscription {
            id: sub_id,
            user_id,
            bot_id,
            exchange_account_id: account_id,
            status: crate::types::SubscriptionStatus::Active,
            overrides: SubscriptionOverrides::default(),
            risk: SubscriptionRisk {
                max_daily_loss_usd: dec!(100),
                max_concurrent_positions: 3,
            },
            counters: Default::default(),
            created_at: Utc::now(),
        };
        (signal, sub)
    }

    async fn state_with_adapter(db: PersistenceGateway, adapter: impl ExchangeAdapter + 'static) -> Arc<AppState> {
        let mut registry = ExchangeRegistry::new();
        registry.register(Arc::new(adapter));
        Arc::new(AppState::new(
            RuntimeConfig::default(),
            db,
            CredentialStore::new(),
            registry,
        ))
    }

    /// Mimics a separate-call venue: no fill price on the entry ack, so
    /// `execute_entry` must fall back to the sizing mark price to compute
    /// SL/TP trigger prices instead of collapsing them to zero.
    struct FakeSeparateCallAdapter {
        mark_price: Decimal,
        qty_step: Decimal,
    }

    #[async_trait]
    impl ExchangeAdapter for FakeSeparateCallAdapter {
        fn venue(&self) -> Venue {
            Venue::A
        }

        fn places_protection_atomically(&self) -> bool {
            false
        }

        async fn probe_position_mode(&self) -> anyhow::Result<PositionMode> {
            Ok(PositionMode::OneWay)
        }

        async fn get_symbol_info(&self, _symbol: &str) -> anyhow::Result<SymbolInfo> {
            Ok(SymbolInfo {
                mark_price: self.mark_price,
                qty_step: self.qty_step,
            })
        }

        async fn open_position(&self, req: &EntryRequest) -> anyhow::Result<EntryResult> {
            Ok(EntryResult {
                entry: OrderAck {
                    exchange_order_id: "entry-1".to_string(),
                    avg_price: None,
                    filled_quantity: Some(req.quantity),
                },
                stop_loss_order_id: None,
                take_profit_order_id: None,
            })
        }

        async fn place_stop_loss(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: Decimal,
            _stop_price: Decimal,
            _position_mode: PositionMode,
        ) -> anyhow::Result<OrderAck> {
            Ok(OrderAck {
                exchange_order_id: "sl-1".to_string(),
                avg_price: None,
                filled_quantity: None,
            })
        }

        async fn place_take_profit(
            &self,
            _symbol: &str,
            _side: Side,
            _quantity: Decimal,
            _trigger_price: Decimal,
            _position_mode: PositionMode,
        ) -> anyhow::Result<OrderAck> {
            Ok(OrderAck {
                exchange_order_id: "tp-1".to_string(),
                avg_price: None,
                filled_quantity: None,
            })
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_order_status(&self, _symbol: &str, _order_id: &str) -> anyhow::Result<OrderStatus> {
            unimplemented!("not exercised by this test")
        }

        async fn get_open_order_ids(&self, _symbol: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn happy_path_sizes_quantity_from_margin_leverage_and_mark_price() {
        let db = PersistenceGateway::connect_in_memory().await.unwrap();
        let (signal, sub) = seed(&db).await;
        let state = state_with_adapter(
            db,
            FakeAdapter {
                mark_price: dec!(50000),
                qty_step: dec!(0.001),
            },
        )
        .await;

        let status = execute_signal_for_subscription(&state, &signal, &sub).await.unwrap();
        assert_eq!(status, SignalExecutionStatus::Success);

        let trades = state.db.list_recent_trades_for_user(sub.user_id, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        // margin=$100, leverage=10, price=$50,000 -> qty=0.020
        assert_eq!(trades[0].entry_quantity, dec!(0.020));
        assert_eq!(trades[0].sl_order_id.as_deref(), Some("sl-1"));
        assert_eq!(trades[0].tp_order_id.as_deref(), Some("tp-1"));
    }

    #[tokio::test]
    async fn quantity_rounding_to_zero_rejects_before_any_exchange_call() {
        let db = PersistenceGateway::connect_in_memory().await.unwrap();
        let (signal, sub) = seed(&db).await;
        let state = state_with_adapter(
            db,
            FakeAdapter {
                // $100 * 10 leverage / $50,000 = 0.02, which rounds down to
                // zero against a lot step of 1 whole unit.
                mark_price: dec!(50000),
                qty_step: dec!(1),
            },
        )
        .await;

        let status = execute_signal_for_subscription(&state, &signal, &sub).await.unwrap();
        assert_eq!(status, SignalExecutionStatus::Failed);

        let trades = state.db.list_recent_trades_for_user(sub.user_id, 10).await.unwrap();
        assert!(trades.is_empty());
    }

    #[tokio::test]
    async fn separate_call_venue_sizes_sl_tp_off_the_sizing_mark_price() {
        let db = PersistenceGateway::connect_in_memory().await.unwrap();
        let (signal, sub) = seed(&db).await;
        let state = state_with_adapter(
            db,
            FakeSeparateCallAdapter {
                mark_price: dec!(50000),
                qty_step: dec!(0.001),
            },
        )
        .await;

        let status = execute_signal_for_subscription(&state, &signal, &sub).await.unwrap();
        assert_eq!(status, SignalExecutionStatus::Success);

        let trades = state.db.list_recent_trades_for_user(sub.user_id, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        let (sl_price, tp_price) = state
            .db
            .get_sl_tp_prices(trades[0].signal_execution_id.unwrap())
            .await
            .unwrap();
        // bot defaults: sl=3%, tp=5% off a $50,000 fallback entry price.
        assert_eq!(sl_price, Some(dec!(48500)));
        assert_eq!(tp_price, Some(dec!(52500)));
    }
}
