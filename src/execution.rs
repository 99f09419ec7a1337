// =============================================================================
// Order Execution Engine
// =============================================================================
//
// Takes a signal that has already cleared the risk gate and turns it into
// exchange orders: computes SL/TP trigger prices from the bot/subscription
// percentages, builds a venue-appropriate `EntryRequest`, places it, and —
// for venues that don't place protection atomically — follows up with
// separate SL/TP calls. Retries transient failures with a fixed backoff
// table from `RuntimeConfig`: try, log, back off, try again.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::errors::EngineError;
use crate::exchange::{EntryRequest, ExchangeAdapter};
use crate::types::{PositionMode, Side};

pub struct ExecutionOutcome {
    pub exchange_order_id: String,
    pub executed_price: Option<Decimal>,
    pub executed_quantity: Option<Decimal>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub sl_price: Decimal,
    pub tp_price: Decimal,
    /// Set when the entry succeeded but one or both protective legs failed
    /// to place — the caller must surface `EngineError::SlTpPartial` and the
    /// monitor's reconciliation pass becomes responsible for closing the
    /// gap.
    pub protection_partial: bool,
}

/// Snap `quantity` down to the nearest multiple of `qty_step`. A non-positive
/// step leaves the quantity unchanged (the venue places no lot-size
/// restriction on the symbol).
pub fn normalize_quantity(quantity: Decimal, qty_step: Decimal) -> Decimal {
    if qty_step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / qty_step).trunc() * qty_step
}

/// Size an entry from margin and leverage against the live mark price, then
/// snap to the venue's lot step. Returns `None` if the normalized quantity
/// rounds down to zero, in which case the caller should reject the order
/// with `EngineError::QtyTooSmall` rather than submit a zero-size order.
pub fn compute_quantity(
    margin_usd: Decimal,
    leverage: u32,
    mark_price: Decimal,
    qty_step: Decimal,
) -> Option<Decimal> {
    if mark_price <= Decimal::ZERO {
        return None;
    }
    let raw = (margin_usd * Decimal::from(leverage)) / mark_price;
    let normalized = normalize_quantity(raw, qty_step);
    if normalized <= Decimal::ZERO {
        None
    } else {
        Some(normalized)
    }
}

/// Compute stop-loss and take-profit trigger prices from an entry price and
/// percentage distances, honoring direction (long SL below/TP above entry,
/// short the reverse).
pub fn compute_sl_tp_prices(
    entry_price: Decimal,
    side: Side,
    sl_pct: Decimal,
    tp_pct: Decimal,
) -> (Decimal, Decimal) {
    let hundred = Decimal::from(100);
    match side {
        Side::Buy => (
            entry_price * (hundred - sl_pct) / hundred,
            entry_price * (hundred + tp_pct) / hundred,
        ),
        Side::Sell => (
            entry_price * (hundred + sl_pct) / hundred,
            entry_price * (hundred - tp_pct) / hundred,
        ),
    }
}

/// Place an entry order (with retry) and, for non-atomic venues, the
/// protective legs that follow it.
#[instrument(skip(adapter, cfg), fields(symbol = %symbol))]
pub async fn execute_entry(
    adapter: &Arc<dyn ExchangeAdapter>,
    cfg: &RuntimeConfig,
    symbol: &str,
    side: Side,
    quantity: Decimal,
    leverage: u32,
    position_mode: PositionMode,
    sl_pct: Decimal,
    tp_pct: Decimal,
    sizing_mark_price: Decimal,
) -> Result<ExecutionOutcome, EngineError> {
    let atomic = adapter.places_protection_atomically();

    let entry_result = retry(cfg, "open_position", || async {
        let req = EntryRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            leverage,
            position_mode,
            stop_loss_price: None,
            take_profit_price: None,
        };
        adapter.open_position(&req).await
    })
    .await?;

    // Separate-call venues never report a fill price on the entry ack; fall
    // back to the mark price the quantity was sized against rather than
    // let SL/TP trigger prices collapse to zero.
    let entry_price = entry_result.entry.avg_price.unwrap_or(sizing_mark_price);
    let (sl_price, tp_price) = compute_sl_tp_prices(entry_price, side, sl_pct, tp_pct);

    if atomic {
        return Ok(ExecutionOutcome {
            exchange_order_id: entry_result.entry.exchange_order_id,
            executed_price: entry_result.entry.avg_price,
            executed_quantity: entry_result.entry.filled_quantity,
            sl_order_id: entry_result.stop_loss_order_id,
            tp_order_id: entry_result.take_profit_order_id,
            sl_price,
            tp_price,
            protection_partial: false,
        });
    }

    let fill_qty = entry_result.entry.filled_quantity.unwrap_or(quantity);

    let sl_outcome = retry(cfg, "place_stop_loss", || {
        adapter.place_stop_loss(symbol, side, fill_qty, sl_price, position_mode)
    })
    .await;
    let tp_outcome = retry(cfg, "place_take_profit", || {
        adapter.place_take_profit(symbol, side, fill_qty, tp_price, position_mode)
    })
    .await;

    let protection_partial = sl_outcome.is_err() || tp_outcome.is_err();
    if protection_partial {
        warn!(
            symbol,
            sl_ok = sl_outcome.is_ok(),
            tp_ok = tp_outcome.is_ok(),
            "protective leg failed to place after entry; flagging for reconciliation"
        );
    }

    Ok(ExecutionOutcome {
        exchange_order_id: entry_result.entry.exchange_order_id,
        executed_price: entry_result.entry.avg_price,
        executed_quantity: entry_result.entry.filled_quantity,
        sl_order_id: sl_outcome.ok().map(|o| o.exchange_order_id),
        tp_order_id: tp_outcome.ok().map(|o| o.exchange_order_id),
        sl_price,
        tp_price,
        protection_partial,
    })
}

/// Best-effort cancellation of the paired protective order after a close —
/// tolerates the leg already being gone. Never returns an error that
/// should block marking the trade closed; logs and moves on.
pub async fn cancel_opposite_leg(adapter: &Arc<dyn ExchangeAdapter>, symbol: &str, order_id: Option<&str>) {
    let Some(order_id) = order_id else { return };
    if let Err(e) = adapter.cancel_order(symbol, order_id).await {
        warn!(symbol, order_id, error = %e, "failed to cancel paired protective leg; will be swept on next reconciliation");
    }
}

async fn retry<F, Fut, T>(cfg: &RuntimeConfig, op_name: &str, mut f: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= cfg.order_retry_max_attempts {
                    warn!(op = op_name, attempt, error = %e, "exhausted retries");
                    return Err(EngineError::Network(e.to_string()));
                }
                let delay_idx = (attempt as usize - 1).min(cfg.order_retry_backoff_sec.len() - 1);
                let delay = cfg.order_retry_backoff_sec[delay_idx];
                info!(op = op_name, attempt, delay_sec = delay, error = %e, "retrying after backoff");
                sleep(Duration::from_secs(delay)).await;
            }
        }
    }
}

/// Stable order-of-magnitude opaque id used when an order must be recorded
/// before any exchange round trip completes (e.g. audit row creation).
pub fn new_execution_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sl_tp_below_above_for_long() {
        let (sl, tp) = compute_sl_tp_prices(dec!(100), Side::Buy, dec!(2), dec!(4));
        assert_eq!(sl, dec!(98));
        assert_eq!(tp, dec!(104));
    }

    #[test]
    fn sl_tp_above_below_for_short() {
        let (sl, tp) = compute_sl_tp_prices(dec!(100), Side::Sell, dec!(2), dec!(4));
        assert_eq!(sl, dec!(102));
        assert_eq!(tp, dec!(96));
    }

    #[test]
    fn normalize_quantity_snaps_down_to_lot_step() {
        assert_eq!(normalize_quantity(dec!(0.12345), dec!(0.001)), dec!(0.123));
        assert_eq!(normalize_quantity(dec!(1.999), dec!(1)), dec!(1));
    }

    #[test]
    fn normalize_quantity_passes_through_when_step_is_zero() {
        assert_eq!(normalize_quantity(dec!(0.12345), Decimal::ZERO), dec!(0.12345));
    }

    #[test]
    fn compute_quantity_matches_happy_path_scenario() {
        // margin=$100, leverage=10, price=$50,000 -> qty=0.020
        let qty = compute_quantity(dec!(100), 10, dec!(50000), dec!(0.001)).unwrap();
        assert_eq!(qty, dec!(0.020));
    }

    #[test]
    fn compute_quantity_rejects_when_it_rounds_to_zero() {
        // Tiny margin against a huge lot step rounds to nothing tradable.
        assert!(compute_quantity(dec!(1), 1, dec!(50000), dec!(1)).is_none());
    }

    #[test]
    fn compute_quantity_rejects_non_positive_price() {
        assert!(compute_quantity(dec!(100), 10, Decimal::ZERO, dec!(0.001)).is_none());
    }
}
