// =============================================================================
// Scheduler — daily rollover and ghost-trade sweep
// =============================================================================
//
// A single tick loop drives two independent duties, each paced against its
// own interval rather than firing every tick:
//
//   - Daily rollover: once per UTC day, at `daily_report_hour_utc`, zero
//     every subscription's rolling daily-loss counter so the loss-cap gate
//     in `risk::check` starts the new day with full headroom.
//   - Ghost-trade sweep: per exchange account, paced by
//     `sync_interval_venue_tight_sec` for venues that only support separate
//     SL/TP calls (more can go wrong between the three legs) and
//     `sync_interval_default_sec` otherwise, looks for trades whose
//     protective legs were never placed (a partial-protection failure) and
//     whose entry order has since vanished from the venue's open orders —
//     i.e. the position closed out from under us with no local record of
//     why. These get closed flat, tagged `GhostCleanupSync`, rather than
//     left open forever against a position that no longer exists.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Timelike, Utc};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::trade_tracker::TradeTracker;
use crate::types::{ExitReason, Venue};

const TICK_SECS: u64 = 60;

fn sync_interval_for(venue: Venue, cfg: &crate::config::RuntimeConfig) -> i64 {
    match venue {
        Venue::A => cfg.sync_interval_default_sec as i64,
        _ => cfg.sync_interval_venue_tight_sec as i64,
    }
}

pub async fn run_scheduler(state: Arc<AppState>, tracker: Arc<TradeTracker>) {
    info!(tick_secs = TICK_SECS, "scheduler started");
    let mut ticker = interval(Duration::from_secs(TICK_SECS));

    let mut last_daily_reset: Option<NaiveDate> = None;
    let mut last_ghost_sweep: HashMap<Uuid, i64> = HashMap::new();

    loop {
        ticker.tick().await;

        if let Err(e) = maybe_run_daily_rollover(&state, &mut last_daily_reset).await {
            error!(error = %e, "scheduler: daily rollover failed");
        }

        if let Err(e) = ghost_trade_sweep(&state, &tracker, &mut last_ghost_sweep).await {
            error!(error = %e, "scheduler: ghost-trade sweep failed");
        }
    }
}

async fn maybe_run_daily_rollover(state: &Arc<AppState>, last_reset: &mut Option<NaiveDate>) -> anyhow::Result<()> {
    let now = Utc::now();
    let target_hour = state.config.read().daily_report_hour_utc;
    let today = now.date_naive();

    if now.hour() != target_hour as u32 {
        return Ok(());
    }
    if *last_reset == Some(today) {
        return Ok(());
    }

    let affected = state.db.reset_daily_counters().await?;
    *last_reset = Some(today);
    state.increment_version();
    info!(subscriptions_reset = affected, "scheduler: daily loss counters rolled over");
    Ok(())
}

async fn ghost_trade_sweep(
    state: &Arc<AppState>,
    tracker: &Arc<TradeTracker>,
    last_sweep: &mut HashMap<Uuid, i64>,
) -> anyhow::Result<()> {
    let open_trades = state.db.list_all_open_trades().await?;
    if open_trades.is_empty() {
        return Ok(());
    }

    let now = Utc::now().timestamp();
    let mut by_account: HashMap<Uuid, Vec<crate::types::Trade>> = HashMap::new();
    for trade in open_trades {
        by_account.entry(trade.exchange_account_id).or_default().push(trade);
    }

    for (account_id, trades) in by_account {
        let Some(account) = state.db.get_exchange_account(account_id).await? else {
            continue;
        };
        let cfg = state.config.read().clone();
        let interval_sec = sync_interval_for(account.venue, &cfg);
        let due = last_sweep
            .get(&account_id)
            .map(|last| now - last >= interval_sec)
            .unwrap_or(true);
        if !due {
            continue;
        }
        last_sweep.insert(account_id, now);

        let Some(adapter) = state.exchange_registry.get(account.venue) else {
            warn!(%account_id, venue = %account.venue, "ghost sweep: no adapter registered");
            continue;
        };

        for trade in trades {
            if trade.sl_order_id.is_some() || trade.tp_order_id.is_some() {
                // Has at least one protective leg on file; the exit monitor
                // owns reconciling this trade.
                continue;
            }

            let Some(entry_order_id) = (match trade.signal_execution_id {
                Some(id) => state.db.get_entry_order_id(id).await?,
                None => None,
            }) else {
                // No entry order on file to check; nothing for the sweep to do.
                continue;
            };

            let open_order_ids = match adapter.get_open_order_ids(&trade.symbol).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "ghost sweep: failed to fetch open orders");
                    continue;
                }
            };

            let entry_order_still_open = open_order_ids.iter().any(|id| id == &entry_order_id);
            if entry_order_still_open {
                continue;
            }

            debug!(trade_id = %trade.id, symbol = %trade.symbol, "ghost sweep: entry has no matching open order, closing flat");
            let closed = tracker
                .close_trade(state, &trade, trade.entry_price, ExitReason::GhostCleanupSync)
                .await?;
            if closed {
                warn!(trade_id = %trade.id, "ghost trade closed flat with no protective legs on file");
            }
        }
    }

    Ok(())
}
