// =============================================================================
// Venues B/C/D adapter — separate-call entry/SL/TP with hedge-mode quirks
// =============================================================================
//
// Unlike venue A, these venues only accept an entry order; stop-loss and
// take-profit must be placed as their own signed calls against the same
// symbol. When the account runs in hedge mode, every call (entry, SL, TP,
// cancel) must additionally carry `positionSide` (`LONG`/`SHORT`) — get it
// wrong and the venue rejects the order outright. One struct serves B, C
// and D since they differ only in base URL and the instantiating side
// tags the concrete venue for logging/error attribution.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::exchange::{
    opposite_side, EntryRequest, EntryResult, ExchangeAdapter, OrderAck, OrderStatus, SymbolInfo,
};
use crate::types::{Direction, PositionMode, Side, Venue};

type HmacSha256 = Hmac<Sha256>;
const RECV_WINDOW_MS: u64 = 5000;

pub struct SeparateCallVenueClient {
    venue: Venue,
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for SeparateCallVenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeparateCallVenueClient")
            .field("venue", &self.venue)
            .field("base_url", &self.base_url)
            .field("api_key", &"***redacted***")
            .field("secret", &"***redacted***")
            .finish()
    }
}

impl SeparateCallVenueClient {
    pub fn new(
        venue: Venue,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-BAPI-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            venue,
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Hedge mode requires a `positionSide` tag derived from the entry side;
    /// one-way mode omits it entirely (the venue rejects the field if sent).
    fn position_side_param(side: Side, position_mode: PositionMode) -> String {
        if position_mode != PositionMode::Hedge {
            return String::new();
        }
        let direction = match side {
            Side::Buy => Direction::Long,
            Side::Sell => Direction::Short,
        };
        format!("&positionSide={}", match direction {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        })
    }

    /// `order_side` is the direction of this specific call (Buy/Sell on the
    /// `side` field); `position_side` is the position's own direction and
    /// drives the `positionSide` tag — for a closing order the two differ
    /// (a long's protective legs sell, but still tag `positionSide=LONG`).
    async fn place_order(
        &self,
        symbol: &str,
        order_side: Side,
        position_side: Side,
        order_type: &str,
        quantity: Decimal,
        trigger_price: Option<Decimal>,
        reduce_only: bool,
        position_mode: PositionMode,
    ) -> Result<OrderAck> {
        let side_str = match order_side {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        };
        let mut params = format!("symbol={symbol}&side={side_str}&orderType={order_type}&qty={quantity}");
        if let Some(trigger) = trigger_price {
            params.push_str(&format!("&triggerPrice={trigger}"));
        }
        // Hedge mode rejects reduceOnly outright — positionSide alone
        // disambiguates which leg of the hedge a close order targets.
        if reduce_only && position_mode != PositionMode::Hedge {
            params.push_str("&reduceOnly=true");
        }
        params.push_str(&Self::position_side_param(position_side, position_mode));

        let qs = self.signed_query(&params);
        let url = format!("{}/v5/order/create?{qs}", self.base_url);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("{:?} place_order request failed", self.venue))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("place_order parse failed")?;
        if !status.is_success() {
            anyhow::bail!("{:?} place_order returned {status}: {body}", self.venue);
        }

        let order_id = body
            .pointer("/result/orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();

        Ok(OrderAck {
            exchange_order_id: order_id,
            avg_price: None,
            filled_quantity: None,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for SeparateCallVenueClient {
    fn venue(&self) -> Venue {
        self.venue
    }

    fn places_protection_atomically(&self) -> bool {
        false
    }

    #[instrument(skip(self), name = "venue_bcd::probe_position_mode")]
    async fn probe_position_mode(&self) -> Result<PositionMode> {
        let qs = self.signed_query("category=linear");
        let url = format!("{}/v5/position/list?{qs}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("probe_position_mode request failed")?;
        let body: serde_json::Value = resp.json().await.context("probe_position_mode parse failed")?;
        let hedge = body
            .pointer("/result/list/0/positionIdx")
            .and_then(|v| v.as_i64())
            .map(|idx| idx != 0)
            .unwrap_or(true);
        Ok(if hedge { PositionMode::Hedge } else { PositionMode::OneWay })
    }

    #[instrument(skip(self), name = "venue_bcd::get_symbol_info")]
    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let price_url = format!("{}/v5/market/tickers?category=linear&symbol={symbol}", self.base_url);
        let price_resp = self
            .client
            .get(&price_url)
            .send()
            .await
            .context("tickers request failed")?;
        let price_body: serde_json::Value = price_resp.json().await.context("tickers parse failed")?;
        let mark_price = price_body
            .pointer("/result/list/0/markPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| anyhow::anyhow!("tickers response missing markPrice"))?;

        let info_url = format!(
            "{}/v5/market/instruments-info?category=linear&symbol={symbol}",
            self.base_url
        );
        let info_resp = self
            .client
            .get(&info_url)
            .send()
            .await
            .context("instruments-info request failed")?;
        let info_body: serde_json::Value =
            info_resp.json().await.context("instruments-info parse failed")?;
        let qty_step = info_body
            .pointer("/result/list/0/lotSizeFilter/qtyStep")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| anyhow::anyhow!("instruments-info response missing qtyStep"))?;

        Ok(SymbolInfo { mark_price, qty_step })
    }

    #[instrument(skip(self, req), name = "venue_bcd::open_position")]
    async fn open_position(&self, req: &EntryRequest) -> Result<EntryResult> {
        debug!(symbol = %req.symbol, venue = ?self.venue, "opening entry; protection placed as follow-up calls");
        let entry = self
            .place_order(
                &req.symbol,
                req.side,
                req.side,
                "Market",
                req.quantity,
                None,
                false,
                req.position_mode,
            )
            .await?;

        Ok(EntryResult {
            entry,
            stop_loss_order_id: None,
            take_profit_order_id: None,
        })
    }

    #[instrument(skip(self), name = "venue_bcd::place_stop_loss")]
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
        position_mode: PositionMode,
    ) -> Result<OrderAck> {
        // Closing order is on the opposite side of the position, reduce-only,
        // but still tagged with the position's own positionSide.
        self.place_order(
            symbol,
            opposite_side(side),
            side,
            "Market",
            quantity,
            Some(stop_price),
            true,
            position_mode,
        )
        .await
    }

    #[instrument(skip(self), name = "venue_bcd::place_take_profit")]
    async fn place_take_profit(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        trigger_price: Decimal,
        position_mode: PositionMode,
    ) -> Result<OrderAck> {
        self.place_order(
            symbol,
            opposite_side(side),
            side,
            "Limit",
            quantity,
            Some(trigger_price),
            true,
            position_mode,
        )
        .await
    }

    #[instrument(skip(self), name = "venue_bcd::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/v5/order/cancel?{qs}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("cancel_order request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        // These venues report "already closed" via a retCode rather than
        // an HTTP 404; tolerate both.
        let already_gone = body.get("retCode").and_then(|v| v.as_i64()) == Some(110001);
        if !status.is_success() && !already_gone {
            anyhow::bail!("{:?} cancel_order returned {status}: {body}", self.venue);
        }
        Ok(())
    }

    #[instrument(skip(self), name = "venue_bcd::get_order_status")]
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus> {
        let params = format!("symbol={symbol}&orderId={order_id}&category=linear");
        let qs = self.signed_query(&params);
        let url = format!("{}/v5/order/realtime?{qs}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("get_order_status request failed")?;
        let body: serde_json::Value = resp.json().await.context("get_order_status parse failed")?;
        let status_str = body
            .pointer("/result/list/0/orderStatus")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(OrderStatus {
            exchange_order_id: order_id.to_string(),
            is_open: matches!(status_str, "New" | "PartiallyFilled"),
            is_filled: status_str == "Filled",
        })
    }

    #[instrument(skip(self), name = "venue_bcd::get_open_order_ids")]
    async fn get_open_order_ids(&self, symbol: &str) -> Result<Vec<String>> {
        let params = format!("symbol={symbol}&category=linear");
        let qs = self.signed_query(&params);
        let url = format!("{}/v5/order/realtime?{qs}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("get_open_order_ids request failed")?;
        let body: serde_json::Value = resp.json().await.context("get_open_order_ids parse failed")?;
        let list = body
            .pointer("/result/list")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(list
            .iter()
            .filter_map(|v| v.get("orderId").map(|id| id.to_string()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_side_param_empty_in_one_way_mode() {
        assert_eq!(
            SeparateCallVenueClient::position_side_param(Side::Buy, PositionMode::OneWay),
            ""
        );
    }

    #[test]
    fn position_side_param_tags_long_and_short_in_hedge_mode() {
        assert_eq!(
            SeparateCallVenueClient::position_side_param(Side::Buy, PositionMode::Hedge),
            "&positionSide=LONG"
        );
        assert_eq!(
            SeparateCallVenueClient::position_side_param(Side::Sell, PositionMode::Hedge),
            "&positionSide=SHORT"
        );
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let client = SeparateCallVenueClient::new(Venue::B, "key", "secret", "https://example.test");
        let printed = format!("{client:?}");
        assert!(!printed.contains("key"));
        assert!(!printed.contains("secret"));
    }
}
