// =============================================================================
// Exchange Adapter
// =============================================================================
//
// One trait, four venue implementations. Venue A exposes an atomic
// entry-plus-protection order (the exchange accepts stop-loss/take-profit
// alongside the entry in a single signed request); venues B, C and D only
// support placing the entry, then the SL and TP as separate signed calls,
// and additionally require a `positionSide` field whenever the account is
// running in hedge mode. Both adapters share the same HTTP/signing
// plumbing: HMAC-SHA256 over a sorted query string,
// `#[instrument(skip(...))]` on every call, and a redacting `Debug` impl.

mod variant_a;
mod variant_b;

pub use variant_a::AtomicVenueClient;
pub use variant_b::SeparateCallVenueClient;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{PositionMode, Side, Venue};

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub avg_price: Option<Decimal>,
    pub filled_quantity: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub exchange_order_id: String,
    pub is_open: bool,
    pub is_filled: bool,
}

#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub leverage: u32,
    pub position_mode: PositionMode,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct EntryResult {
    pub entry: OrderAck,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolInfo {
    pub mark_price: Decimal,
    /// Smallest quantity increment the venue accepts; order quantities must
    /// be a multiple of this before submission.
    pub qty_step: Decimal,
}

/// Capability contract every venue adapter fulfils, regardless of whether it
/// places protection atomically or as follow-up calls — callers in
/// `execution.rs` never need to branch on venue, only on the outcome.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Whether this venue places SL/TP in the same call as the entry. When
    /// `false`, `execution.rs` is responsible for the follow-up
    /// `place_stop_loss`/`place_take_profit` calls after `open_position`.
    fn places_protection_atomically(&self) -> bool;

    async fn probe_position_mode(&self) -> Result<PositionMode>;

    /// Live mark price and lot-size step for `symbol`, used to size an
    /// entry before it is placed.
    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn open_position(&self, req: &EntryRequest) -> Result<EntryResult>;

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
        position_mode: PositionMode,
    ) -> Result<OrderAck>;

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        trigger_price: Decimal,
        position_mode: PositionMode,
    ) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus>;

    async fn get_open_order_ids(&self, symbol: &str) -> Result<Vec<String>>;
}

/// A close order's side is always the opposite of the entry side.
pub fn opposite_side(side: Side) -> Side {
    match side {
        Side::Buy => Side::Sell,
        Side::Sell => Side::Buy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_side_flips() {
        assert_eq!(opposite_side(Side::Buy), Side::Sell);
        assert_eq!(opposite_side(Side::Sell), Side::Buy);
    }
}
