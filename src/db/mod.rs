// =============================================================================
// Persistence Gateway — typed access to the relational store
// =============================================================================
//
// Runtime-query sqlx throughout (bind + fetch_optional/fetch_all, no
// compile-time `query!` macros, since the database isn't available at build
// time here). SQLite is the default backing (see migrations/0001_init.sql);
// the same shape works unchanged against `sqlx::PgPool` if the deployment
// swaps backends.
//
// Every row is stored with decimals and UUIDs as TEXT so they round-trip
// exactly through `rust_decimal::Decimal` and `uuid::Uuid` without float
// drift. Row structs hold the raw TEXT columns and are converted to domain
// types at the edge of this module.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::str::FromStr;
use uuid::Uuid;

use crate::types::*;

pub struct PersistenceGateway {
    pool: SqlitePool,
}

// ---------------------------------------------------------------------------
// Small parse helpers shared by every row conversion below.
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid uuid '{s}' in row"))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp '{s}' in row"))
}

fn parse_dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("invalid decimal '{s}' in row"))
}

impl PersistenceGateway {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .with_context(|| format!("failed to connect to database at {database_url}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -------------------------------------------------------------------
    // Exchange accounts
    // -------------------------------------------------------------------

    pub async fn get_exchange_account(&self, id: Uuid) -> Result<Option<ExchangeAccount>> {
        let row: Option<(String, String, String, String, i64, i64, Option<String>, String)> =
            sqlx::query_as(
                "SELECT id, owner_user_id, venue, credentials, is_testnet, is_active, position_mode, created_at
                 FROM exchange_accounts WHERE id = ?",
            )
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("get_exchange_account query failed")?;

        row.map(|r| {
            Ok(ExchangeAccount {
                id: parse_uuid(&r.0)?,
                owner_user_id: parse_uuid(&r.1)?,
                venue: r.2.parse()?,
                credentials: r.3,
                is_testnet: r.4 != 0,
                is_active: r.5 != 0,
                position_mode: r.6.as_deref().map(|s| match s {
                    "hedge" => Ok(PositionMode::Hedge),
                    "one_way" => Ok(PositionMode::OneWay),
                    other => anyhow::bail!("unknown position_mode '{other}'"),
                }).transpose()?,
                created_at: parse_ts(&r.7)?,
            })
        })
        .transpose()
    }

    pub async fn set_position_mode(&self, id: Uuid, mode: PositionMode) -> Result<()> {
        sqlx::query("UPDATE exchange_accounts SET position_mode = ? WHERE id = ?")
            .bind(mode.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("set_position_mode failed")?;
        Ok(())
    }

    /// All active exchange accounts, one per venue in practice — used at
    /// startup to build the `ExchangeRegistry` and by admin tooling to list
    /// configured venues.
    pub async fn list_active_exchange_accounts(&self) -> Result<Vec<ExchangeAccount>> {
        let rows: Vec<(String, String, String, String, i64, i64, Option<String>, String)> = sqlx::query_as(
            "SELECT id, owner_user_id, venue, credentials, is_testnet, is_active, position_mode, created_at
             FROM exchange_accounts WHERE is_active = 1",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_active_exchange_accounts query failed")?;

        rows.into_iter()
            .map(|r| {
                Ok(ExchangeAccount {
                    id: parse_uuid(&r.0)?,
                    owner_user_id: parse_uuid(&r.1)?,
                    venue: r.2.parse()?,
                    credentials: r.3,
                    is_testnet: r.4 != 0,
                    is_active: r.5 != 0,
                    position_mode: r.6.as_deref().map(|s| match s {
                        "hedge" => Ok(PositionMode::Hedge),
                        "one_way" => Ok(PositionMode::OneWay),
                        other => anyhow::bail!("unknown position_mode '{other}'"),
                    }).transpose()?,
                    created_at: parse_ts(&r.7)?,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------
    // Bots & subscriptions
    // -------------------------------------------------------------------

    pub async fn get_bot(&self, id: Uuid) -> Result<Option<Bot>> {
        let row: Option<(String, String, i64, String, String, String, String, String, String)> =
            sqlx::query_as(
                "SELECT id, name, default_leverage, default_margin_usd, default_sl_pct,
                        default_tp_pct, market_type, allowed_directions, created_at
                 FROM bots WHERE id = ?",
            )
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("get_bot query failed")?;

        row.map(|r| {
            Ok(Bot {
                id: parse_uuid(&r.0)?,
                name: r.1,
                defaults: BotDefaults {
                    leverage: r.2 as u32,
                    margin_usd: parse_dec(&r.3)?,
                    stop_loss_pct: parse_dec(&r.4)?,
                    take_profit_pct: parse_dec(&r.5)?,
                },
                market_type: match r.6.as_str() {
                    "spot" => MarketType::Spot,
                    "futures" => MarketType::Futures,
                    other => anyhow::bail!("unknown market_type '{other}'"),
                },
                allowed_directions: match r.7.as_str() {
                    "buy_only" => AllowedDirections::BuyOnly,
                    "sell_only" => AllowedDirections::SellOnly,
                    "both" => AllowedDirections::Both,
                    other => anyhow::bail!("unknown allowed_directions '{other}'"),
                },
                created_at: parse_ts(&r.8)?,
            })
        })
        .transpose()
    }

    pub async fn list_active_subscriptions_for_bot(&self, bot_id: Uuid) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            "SELECT id, user_id, bot_id, exchange_account_id, status,
                    leverage_override, margin_usd_override, stop_loss_pct_override, take_profit_pct_override,
                    max_daily_loss_usd, max_concurrent_positions,
                    current_daily_loss_usd, current_positions, total_pnl_usd,
                    win_count, loss_count, total_signals_received, total_orders_executed, total_orders_failed,
                    created_at
             FROM subscriptions WHERE bot_id = ? AND status = 'active'",
        )
        .bind(bot_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("list_active_subscriptions_for_bot query failed")?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    pub async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT id, user_id, bot_id, exchange_account_id, status,
                    leverage_override, margin_usd_override, stop_loss_pct_override, take_profit_pct_override,
                    max_daily_loss_usd, max_concurrent_positions,
                    current_daily_loss_usd, current_positions, total_pnl_usd,
                    win_count, loss_count, total_signals_received, total_orders_executed, total_orders_failed,
                    created_at
             FROM subscriptions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("get_subscription query failed")?;

        row.map(Subscription::try_from).transpose()
    }

    pub async fn apply_subscription_counters(&self, sub: &Subscription) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET
                current_daily_loss_usd = ?, current_positions = ?, total_pnl_usd = ?,
                win_count = ?, loss_count = ?, total_signals_received = ?,
                total_orders_executed = ?, total_orders_failed = ?
             WHERE id = ?",
        )
        .bind(sub.counters.current_daily_loss_usd.to_string())
        .bind(sub.counters.current_positions as i64)
        .bind(sub.counters.total_pnl_usd.to_string())
        .bind(sub.counters.win_count as i64)
        .bind(sub.counters.loss_count as i64)
        .bind(sub.counters.total_signals_received as i64)
        .bind(sub.counters.total_orders_executed as i64)
        .bind(sub.counters.total_orders_failed as i64)
        .bind(sub.id.to_string())
        .execute(&self.pool)
        .await
        .context("apply_subscription_counters failed")?;
        Ok(())
    }

    pub async fn reset_daily_counters(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE subscriptions SET current_daily_loss_usd = '0'")
            .execute(&self.pool)
            .await
            .context("reset_daily_counters failed")?;
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------
    // Signals & executions
    // -------------------------------------------------------------------

    pub async fn insert_signal(&self, s: &Signal) -> Result<()> {
        sqlx::query(
            "INSERT INTO signals (id, bot_id, ticker, action, source_ip, raw_payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(s.id.to_string())
        .bind(s.bot_id.to_string())
        .bind(&s.ticker)
        .bind(s.action.to_string())
        .bind(&s.source_ip)
        .bind(s.raw_payload.to_string())
        .bind(s.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("insert_signal failed")?;
        Ok(())
    }

    pub async fn complete_signal(
        &self,
        id: Uuid,
        total_subscribers: u32,
        successful: u32,
        failed: u32,
        duration_ms: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE signals SET completed_at = ?, total_subscribers = ?, successful_executions = ?,
                failed_executions = ?, broadcast_duration_ms = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(total_subscribers as i64)
        .bind(successful as i64)
        .bind(failed as i64)
        .bind(duration_ms as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("complete_signal failed")?;
        Ok(())
    }

    pub async fn insert_signal_execution(&self, e: &SignalExecution) -> Result<()> {
        sqlx::query(
            "INSERT INTO signal_executions
                (id, signal_id, subscription_id, user_id, exchange_account_id, status,
                 execution_time_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(e.id.to_string())
        .bind(e.signal_id.to_string())
        .bind(e.subscription_id.to_string())
        .bind(e.user_id.to_string())
        .bind(e.exchange_account_id.to_string())
        .bind(e.status.to_string())
        .bind(e.execution_time_ms as i64)
        .bind(e.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("insert_signal_execution failed")?;
        Ok(())
    }

    pub async fn complete_signal_execution(&self, e: &SignalExecution) -> Result<()> {
        sqlx::query(
            "UPDATE signal_executions SET
                status = ?, exchange_order_id = ?, executed_price = ?, executed_quantity = ?,
                sl_order_id = ?, tp_order_id = ?, sl_price = ?, tp_price = ?,
                error_message = ?, error_code = ?, execution_time_ms = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(e.status.to_string())
        .bind(&e.exchange_order_id)
        .bind(e.executed_price.map(|d| d.to_string()))
        .bind(e.executed_quantity.map(|d| d.to_string()))
        .bind(&e.sl_order_id)
        .bind(&e.tp_order_id)
        .bind(e.sl_price.map(|d| d.to_string()))
        .bind(e.tp_price.map(|d| d.to_string()))
        .bind(&e.error_message)
        .bind(&e.error_code)
        .bind(e.execution_time_ms as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(e.id.to_string())
        .execute(&self.pool)
        .await
        .context("complete_signal_execution failed")?;
        Ok(())
    }

    /// Look up the stop-loss/take-profit prices recorded against the
    /// `signal_execution` that opened a trade, for the monitor to use as the
    /// close price when a protective order fills (exchanges don't report a
    /// fill price through the order-status poll this engine uses).
    pub async fn get_sl_tp_prices(&self, signal_execution_id: Uuid) -> Result<(Option<Decimal>, Option<Decimal>)> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT sl_price, tp_price FROM signal_executions WHERE id = ?",
        )
        .bind(signal_execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("get_sl_tp_prices query failed")?;

        match row {
            Some((sl, tp)) => Ok((
                sl.map(|s| parse_dec(&s)).transpose()?,
                tp.map(|s| parse_dec(&s)).transpose()?,
            )),
            None => Ok((None, None)),
        }
    }

    /// Look up the exchange order id recorded for the entry leg of a trade's
    /// originating `signal_execution`, for the ghost-trade sweep to check
    /// whether the entry itself is still resting on the venue.
    pub async fn get_entry_order_id(&self, signal_execution_id: Uuid) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT exchange_order_id FROM signal_executions WHERE id = ?",
        )
        .bind(signal_execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("get_entry_order_id query failed")?;

        Ok(row.and_then(|(id,)| id))
    }

    // -------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------

    pub async fn insert_trade(&self, t: &Trade) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades
                (id, subscription_id, user_id, signal_execution_id, exchange_account_id, symbol,
                 side, direction, entry_price, entry_quantity, entry_time, sl_order_id, tp_order_id, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(t.id.to_string())
        .bind(t.subscription_id.to_string())
        .bind(t.user_id.to_string())
        .bind(t.signal_execution_id.map(|v| v.to_string()))
        .bind(t.exchange_account_id.to_string())
        .bind(&t.symbol)
        .bind(t.side.to_string())
        .bind(t.direction.to_string())
        .bind(t.entry_price.to_string())
        .bind(t.entry_quantity.to_string())
        .bind(t.entry_time.to_rfc3339())
        .bind(&t.sl_order_id)
        .bind(&t.tp_order_id)
        .bind("open")
        .execute(&self.pool)
        .await
        .context("insert_trade failed")?;
        Ok(())
    }

    /// Update a trade's `sl_order_id` or `tp_order_id` column after an admin
    /// SL/TP mutation. `column` must be one of those two literals — never
    /// derived from request input — since it's interpolated into the query.
    pub async fn update_trade_leg_order_id(&self, id: Uuid, column: &str, order_id: Option<&str>) -> Result<()> {
        anyhow::ensure!(
            column == "sl_order_id" || column == "tp_order_id",
            "invalid trade leg column '{column}'"
        );
        let sql = format!("UPDATE trades SET {column} = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(order_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("update_trade_leg_order_id failed")?;
        Ok(())
    }

    pub async fn get_open_trades_for_account_symbol(
        &self,
        account_id: Uuid,
        symbol: &str,
    ) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(
            "SELECT id, subscription_id, user_id, signal_execution_id, exchange_account_id, symbol,
                    side, direction, entry_price, entry_quantity, entry_time, sl_order_id, tp_order_id,
                    exit_price, exit_quantity, exit_time, exit_reason, pnl_usd, pnl_pct, is_winner, status
             FROM trades WHERE exchange_account_id = ? AND symbol = ? AND status = 'open'",
        )
        .bind(account_id.to_string())
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .context("get_open_trades_for_account_symbol failed")?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    pub async fn list_all_open_trades(&self) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(
            "SELECT id, subscription_id, user_id, signal_execution_id, exchange_account_id, symbol,
                    side, direction, entry_price, entry_quantity, entry_time, sl_order_id, tp_order_id,
                    exit_price, exit_quantity, exit_time, exit_reason, pnl_usd, pnl_pct, is_winner, status
             FROM trades WHERE status = 'open'",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_all_open_trades failed")?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    pub async fn list_recent_trades_for_user(&self, user_id: Uuid, limit: u32) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(
            "SELECT id, subscription_id, user_id, signal_execution_id, exchange_account_id, symbol,
                    side, direction, entry_price, entry_quantity, entry_time, sl_order_id, tp_order_id,
                    exit_price, exit_quantity, exit_time, exit_reason, pnl_usd, pnl_pct, is_winner, status
             FROM trades WHERE user_id = ? ORDER BY entry_time DESC LIMIT ?",
        )
        .bind(user_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("list_recent_trades_for_user failed")?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    /// The sole write path for closing a trade — callers must serialize
    /// through `trade_tracker::TradeTracker` so no two tasks close the same
    /// trade concurrently.
    pub async fn close_trade(
        &self,
        id: Uuid,
        exit_price: Decimal,
        exit_quantity: Decimal,
        exit_reason: ExitReason,
        pnl_usd: Decimal,
        pnl_pct: Decimal,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE trades SET exit_price = ?, exit_quantity = ?, exit_time = ?, exit_reason = ?,
                pnl_usd = ?, pnl_pct = ?, is_winner = ?, status = 'closed'
             WHERE id = ? AND status = 'open'",
        )
        .bind(exit_price.to_string())
        .bind(exit_quantity.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(exit_reason.to_string())
        .bind(pnl_usd.to_string())
        .bind(pnl_pct.to_string())
        .bind(pnl_usd.is_sign_positive() as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("close_trade failed")?;
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------
    // Daily P&L snapshots
    // -------------------------------------------------------------------

    pub async fn upsert_daily_snapshot(&self, snap: &DailyPnlSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_pnl_snapshots
                (subscription_id, user_id, bot_id, snapshot_date, daily_pnl_usd, cumulative_pnl_usd,
                 daily_wins, daily_losses, cumulative_wins, cumulative_losses, win_rate_pct)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(subscription_id, snapshot_date) DO UPDATE SET
                daily_pnl_usd = excluded.daily_pnl_usd,
                cumulative_pnl_usd = excluded.cumulative_pnl_usd,
                daily_wins = excluded.daily_wins,
                daily_losses = excluded.daily_losses,
                cumulative_wins = excluded.cumulative_wins,
                cumulative_losses = excluded.cumulative_losses,
                win_rate_pct = excluded.win_rate_pct",
        )
        .bind(snap.subscription_id.to_string())
        .bind(snap.user_id.to_string())
        .bind(snap.bot_id.to_string())
        .bind(snap.snapshot_date.format("%Y-%m-%d").to_string())
        .bind(snap.daily_pnl_usd.to_string())
        .bind(snap.cumulative_pnl_usd.to_string())
        .bind(snap.daily_wins as i64)
        .bind(snap.daily_losses as i64)
        .bind(snap.cumulative_wins as i64)
        .bind(snap.cumulative_losses as i64)
        .bind(snap.win_rate_pct.to_string())
        .execute(&self.pool)
        .await
        .context("upsert_daily_snapshot failed")?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------

    pub async fn insert_notification(&self, n: &Notification) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (id, user_id, type, category, title, message, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(n.id.to_string())
        .bind(n.user_id.to_string())
        .bind(match n.kind {
            NotificationType::Info => "info",
            NotificationType::Success => "success",
            NotificationType::Warning => "warning",
        })
        .bind(&n.category)
        .bind(&n.title)
        .bind(&n.message)
        .bind(n.metadata.as_ref().map(|v| v.to_string()))
        .bind(n.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("insert_notification failed")?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Webhooks
    // -------------------------------------------------------------------

    pub async fn get_webhook_by_path(&self, url_path: &str) -> Result<Option<Webhook>> {
        let row: Option<WebhookRow> = sqlx::query_as(
            "SELECT id, url_path, bot_id, exchange_account_id, secret, is_public, is_active,
                    margin_usd, leverage, sl_pct, tp_pct, market_type, error_threshold,
                    consecutive_errors, total_deliveries, total_successes, total_failures, created_at
             FROM webhooks WHERE url_path = ?",
        )
        .bind(url_path)
        .fetch_optional(&self.pool)
        .await
        .context("get_webhook_by_path failed")?;

        row.map(Webhook::try_from).transpose()
    }

    pub async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        let row: Option<WebhookRow> = sqlx::query_as(
            "SELECT id, url_path, bot_id, exchange_account_id, secret, is_public, is_active,
                    margin_usd, leverage, sl_pct, tp_pct, market_type, error_threshold,
                    consecutive_errors, total_deliveries, total_successes, total_failures, created_at
             FROM webhooks WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("get_webhook failed")?;

        row.map(Webhook::try_from).transpose()
    }

    /// Admin-initiated pause/resume. Unlike the auto-pause path in
    /// `record_webhook_outcome`, this also resets `consecutive_errors` on
    /// resume so a manually re-enabled webhook doesn't immediately re-trip
    /// the threshold on its first delivery.
    pub async fn set_webhook_active(&self, id: Uuid, active: bool) -> Result<()> {
        sqlx::query(
            "UPDATE webhooks SET is_active = ?, consecutive_errors = CASE WHEN ? THEN 0 ELSE consecutive_errors END
             WHERE id = ?",
        )
        .bind(active as i64)
        .bind(active as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("set_webhook_active failed")?;
        Ok(())
    }

    pub async fn record_webhook_outcome(&self, id: Uuid, success: bool) -> Result<(u32, bool)> {
        let mut tx = self.pool.begin().await.context("begin tx failed")?;

        let row: (i64, i64) = sqlx::query_as(
            "SELECT consecutive_errors, error_threshold FROM webhooks WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_one(&mut *tx)
        .await
        .context("record_webhook_outcome read failed")?;

        let (new_consecutive, should_pause) = if success {
            (0, false)
        } else {
            let next = row.0 + 1;
            (next, next >= row.1)
        };

        sqlx::query(
            "UPDATE webhooks SET
                total_deliveries = total_deliveries + 1,
                total_successes = total_successes + ?,
                total_failures = total_failures + ?,
                consecutive_errors = ?,
                is_active = CASE WHEN ? THEN 0 ELSE is_active END
             WHERE id = ?",
        )
        .bind(success as i64)
        .bind((!success) as i64)
        .bind(new_consecutive)
        .bind(should_pause as i64)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .context("record_webhook_outcome update failed")?;

        tx.commit().await.context("commit tx failed")?;
        Ok((new_consecutive as u32, should_pause))
    }

    pub async fn insert_webhook_delivery(&self, d: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_deliveries (id, webhook_id, status, attempt, signal_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(d.id.to_string())
        .bind(d.webhook_id.to_string())
        .bind(status_str(d.status))
        .bind(d.attempt as i64)
        .bind(d.signal_id.map(|v| v.to_string()))
        .bind(d.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("insert_webhook_delivery failed")?;
        Ok(())
    }

    pub async fn update_webhook_delivery_status(
        &self,
        id: Uuid,
        status: WebhookDeliveryStatus,
        attempt: u32,
        error_message: Option<&str>,
    ) -> Result<()> {
        let completed_at = matches!(
            status,
            WebhookDeliveryStatus::Success | WebhookDeliveryStatus::Failed
        )
        .then(|| Utc::now().to_rfc3339());

        sqlx::query(
            "UPDATE webhook_deliveries SET status = ?, attempt = ?, error_message = ?, completed_at = COALESCE(?, completed_at)
             WHERE id = ?",
        )
        .bind(status_str(status))
        .bind(attempt as i64)
        .bind(error_message)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("update_webhook_delivery_status failed")?;
        Ok(())
    }
}

fn status_str(status: WebhookDeliveryStatus) -> &'static str {
    match status {
        WebhookDeliveryStatus::Pending => "pending",
        WebhookDeliveryStatus::Processing => "processing",
        WebhookDeliveryStatus::Success => "success",
        WebhookDeliveryStatus::Failed => "failed",
        WebhookDeliveryStatus::Retrying => "retrying",
    }
}

// ---------------------------------------------------------------------------
// Row structs + conversions
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    user_id: String,
    bot_id: String,
    exchange_account_id: String,
    status: String,
    leverage_override: Option<i64>,
    margin_usd_override: Option<String>,
    stop_loss_pct_override: Option<String>,
    take_profit_pct_override: Option<String>,
    max_daily_loss_usd: String,
    max_concurrent_positions: i64,
    current_daily_loss_usd: String,
    current_positions: i64,
    total_pnl_usd: String,
    win_count: i64,
    loss_count: i64,
    total_signals_received: i64,
    total_orders_executed: i64,
    total_orders_failed: i64,
    created_at: String,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = anyhow::Error;
    fn try_from(r: SubscriptionRow) -> Result<Self> {
        Ok(Subscription {
            id: parse_uuid(&r.id)?,
            user_id: parse_uuid(&r.user_id)?,
            bot_id: parse_uuid(&r.bot_id)?,
            exchange_account_id: parse_uuid(&r.exchange_account_id)?,
            status: match r.status.as_str() {
                "active" => SubscriptionStatus::Active,
                "paused" => SubscriptionStatus::Paused,
                "cancelled" => SubscriptionStatus::Cancelled,
                other => anyhow::bail!("unknown subscription status '{other}'"),
            },
            overrides: SubscriptionOverrides {
                leverage: r.leverage_override.map(|v| v as u32),
                margin_usd: r.margin_usd_override.as_deref().map(parse_dec).transpose()?,
                stop_loss_pct: r.stop_loss_pct_override.as_deref().map(parse_dec).transpose()?,
                take_profit_pct: r.take_profit_pct_override.as_deref().map(parse_dec).transpose()?,
            },
            risk: SubscriptionRisk {
                max_daily_loss_usd: parse_dec(&r.max_daily_loss_usd)?,
                max_concurrent_positions: r.max_concurrent_positions as u32,
            },
            counters: SubscriptionCounters {
                current_daily_loss_usd: parse_dec(&r.current_daily_loss_usd)?,
                current_positions: r.current_positions as u32,
                total_pnl_usd: parse_dec(&r.total_pnl_usd)?,
                win_count: r.win_count as u32,
                loss_count: r.loss_count as u32,
                total_signals_received: r.total_signals_received as u32,
                total_orders_executed: r.total_orders_executed as u32,
                total_orders_failed: r.total_orders_failed as u32,
            },
            created_at: parse_ts(&r.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TradeRow {
    id: String,
    subscription_id: String,
    user_id: String,
    signal_execution_id: Option<String>,
    exchange_account_id: String,
    symbol: String,
    side: String,
    direction: String,
    entry_price: String,
    entry_quantity: String,
    entry_time: String,
    sl_order_id: Option<String>,
    tp_order_id: Option<String>,
    exit_price: Option<String>,
    exit_quantity: Option<String>,
    exit_time: Option<String>,
    exit_reason: Option<String>,
    pnl_usd: Option<String>,
    pnl_pct: Option<String>,
    is_winner: Option<i64>,
    status: String,
}

impl TryFrom<TradeRow> for Trade {
    type Error = anyhow::Error;
    fn try_from(r: TradeRow) -> Result<Self> {
        Ok(Trade {
            id: parse_uuid(&r.id)?,
            subscription_id: parse_uuid(&r.subscription_id)?,
            user_id: parse_uuid(&r.user_id)?,
            signal_execution_id: r.signal_execution_id.as_deref().map(parse_uuid).transpose()?,
            exchange_account_id: parse_uuid(&r.exchange_account_id)?,
            symbol: r.symbol,
            side: match r.side.as_str() {
                "buy" => Side::Buy,
                "sell" => Side::Sell,
                other => anyhow::bail!("unknown side '{other}'"),
            },
            direction: match r.direction.as_str() {
                "long" => Direction::Long,
                "short" => Direction::Short,
                other => anyhow::bail!("unknown direction '{other}'"),
            },
            entry_price: parse_dec(&r.entry_price)?,
            entry_quantity: parse_dec(&r.entry_quantity)?,
            entry_time: parse_ts(&r.entry_time)?,
            sl_order_id: r.sl_order_id,
            tp_order_id: r.tp_order_id,
            exit_price: r.exit_price.as_deref().map(parse_dec).transpose()?,
            exit_quantity: r.exit_quantity.as_deref().map(parse_dec).transpose()?,
            exit_time: r.exit_time.as_deref().map(parse_ts).transpose()?,
            exit_reason: r.exit_reason.as_deref().map(|s| match s {
                "stop_loss" => Ok(ExitReason::StopLoss),
                "take_profit" => Ok(ExitReason::TakeProfit),
                "manual" => Ok(ExitReason::Manual),
                "end_of_day" => Ok(ExitReason::EndOfDay),
                "ghost_cleanup_sync" => Ok(ExitReason::GhostCleanupSync),
                other => anyhow::bail!("unknown exit_reason '{other}'"),
            }).transpose()?,
            pnl_usd: r.pnl_usd.as_deref().map(parse_dec).transpose()?,
            pnl_pct: r.pnl_pct.as_deref().map(parse_dec).transpose()?,
            is_winner: r.is_winner.map(|v| v != 0),
            status: match r.status.as_str() {
                "open" => TradeStatus::Open,
                "closed" => TradeStatus::Closed,
                other => anyhow::bail!("unknown trade status '{other}'"),
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: String,
    url_path: String,
    bot_id: Option<String>,
    exchange_account_id: Option<String>,
    secret: Option<String>,
    is_public: i64,
    is_active: i64,
    margin_usd: String,
    leverage: i64,
    sl_pct: String,
    tp_pct: String,
    market_type: String,
    error_threshold: i64,
    consecutive_errors: i64,
    total_deliveries: i64,
    total_successes: i64,
    total_failures: i64,
    created_at: String,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = anyhow::Error;
    fn try_from(r: WebhookRow) -> Result<Self> {
        Ok(Webhook {
            id: parse_uuid(&r.id)?,
            url_path: r.url_path,
            bot_id: r.bot_id.as_deref().map(parse_uuid).transpose()?,
            exchange_account_id: r.exchange_account_id.as_deref().map(parse_uuid).transpose()?,
            secret: r.secret,
            is_public: r.is_public != 0,
            is_active: r.is_active != 0,
            margin_usd: parse_dec(&r.margin_usd)?,
            leverage: r.leverage as u32,
            sl_pct: parse_dec(&r.sl_pct)?,
            tp_pct: parse_dec(&r.tp_pct)?,
            market_type: match r.market_type.as_str() {
                "spot" => MarketType::Spot,
                "futures" => MarketType::Futures,
                other => anyhow::bail!("unknown market_type '{other}'"),
            },
            error_threshold: r.error_threshold as u32,
            consecutive_errors: r.consecutive_errors as u32,
            total_deliveries: r.total_deliveries as u32,
            total_successes: r.total_successes as u32,
            total_failures: r.total_failures as u32,
            created_at: parse_ts(&r.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn seed_bot(gw: &PersistenceGateway, bot_id: Uuid) {
        sqlx::query(
            "INSERT INTO bots (id, name, default_leverage, default_margin_usd, default_sl_pct,
                default_tp_pct, market_type, allowed_directions, created_at)
             VALUES (?, 'demo', 5, '100', '1.5', '3.0', 'futures', 'both', ?)",
        )
        .bind(bot_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(gw.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn migrations_apply_and_bot_roundtrips() {
        let gw = PersistenceGateway::connect_in_memory().await.unwrap();
        let bot_id = Uuid::new_v4();
        seed_bot(&gw, bot_id).await;

        let bot = gw.get_bot(bot_id).await.unwrap().unwrap();
        assert_eq!(bot.defaults.leverage, 5);
        assert_eq!(bot.defaults.margin_usd, parse_dec("100").unwrap());
        assert_eq!(bot.allowed_directions, AllowedDirections::Both);
    }

    #[tokio::test]
    async fn trade_close_is_idempotent_against_double_close() {
        let gw = PersistenceGateway::connect_in_memory().await.unwrap();
        let bot_id = Uuid::new_v4();
        seed_bot(&gw, bot_id).await;

        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, 'u@test', ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(gw.pool())
            .await
            .unwrap();

        let trade_id = Uuid::new_v4();
        let sub_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let trade = Trade {
            id: trade_id,
            subscription_id: sub_id,
            user_id,
            signal_execution_id: None,
            exchange_account_id: account_id,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            direction: Direction::Long,
            entry_price: parse_dec("50000").unwrap(),
            entry_quantity: parse_dec("0.1").unwrap(),
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
            status: TradeStatus::Open,
        };

        sqlx::query(
            "INSERT INTO exchange_accounts (id, owner_user_id, venue, credentials, created_at)
             VALUES (?, ?, 'A', 'x', ?)",
        )
        .bind(account_id.to_string())
        .bind(user_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(gw.pool())
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
        .execute(gw.pool())
        .await
        .unwrap();

        gw.insert_trade(&trade).await.unwrap();

        let affected = gw
            .close_trade(
                trade_id,
                parse_dec("51000").unwrap(),
                parse_dec("0.1").unwrap(),
                ExitReason::TakeProfit,
                parse_dec("100").unwrap(),
                parse_dec("2").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        // Second close against the same already-closed row must be a no-op,
        // not a second write — this is what makes the monitor's close path
        // safe to race against a scheduler sweep.
        let affected_again = gw
            .close_trade(
                trade_id,
                parse_dec("52000").unwrap(),
                parse_dec("0.1").unwrap(),
                ExitReason::TakeProfit,
                parse_dec("200").unwrap(),
                parse_dec("4").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(affected_again, 0);
    }
}
