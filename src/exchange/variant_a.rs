// =============================================================================
// Venue A adapter — atomic entry + stop-loss/take-profit
// =============================================================================
//
// HMAC-SHA256 signed query strings, header-based API key auth, a 5 s
// recvWindow tolerance, and `#[instrument(skip(self, ...))]` on every call.
// Venue A's entry endpoint accepts `stopLoss`/`takeProfit` trigger prices
// directly on the entry order, so `open_position` is a single signed call.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::exchange::{EntryRequest, EntryResult, ExchangeAdapter, OrderAck, OrderStatus, SymbolInfo};
use crate::types::{PositionMode, Side, Venue};

type HmacSha256 = Hmac<Sha256>;
const RECV_WINDOW_MS: u64 = 5000;

pub struct AtomicVenueClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AtomicVenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicVenueClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"***redacted***")
            .field("secret", &"***redacted***")
            .finish()
    }
}

impl AtomicVenueClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
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
}

#[async_trait]
impl ExchangeAdapter for AtomicVenueClient {
    fn venue(&self) -> Venue {
        Venue::A
    }

    fn places_protection_atomically(&self) -> bool {
        true
    }

    #[instrument(skip(self), name = "venue_a::probe_position_mode")]
    async fn probe_position_mode(&self) -> Result<PositionMode> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v1/positionSide/dual?{qs}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("probe_position_mode request failed")?;
        let body: serde_json::Value = resp.json().await.context("probe_position_mode parse failed")?;
        let dual = body.get("dualSidePosition").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(if dual { PositionMode::Hedge } else { PositionMode::OneWay })
    }

    #[instrument(skip(self), name = "venue_a::get_symbol_info")]
    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let price_url = format!("{}/fapi/v1/premiumIndex?symbol={symbol}", self.base_url);
        let price_resp = self
            .client
            .get(&price_url)
            .send()
            .await
            .context("premiumIndex request failed")?;
        let price_body: serde_json::Value =
            price_resp.json().await.context("premiumIndex parse failed")?;
        let mark_price = price_body
            .get("markPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| anyhow::anyhow!("premiumIndex response missing markPrice"))?;

        let info_url = format!("{}/fapi/v1/exchangeInfo?symbol={symbol}", self.base_url);
        let info_resp = self
            .client
            .get(&info_url)
            .send()
            .await
            .context("exchangeInfo request failed")?;
        let info_body: serde_json::Value =
            info_resp.json().await.context("exchangeInfo parse failed")?;
        let qty_step = info_body
            .pointer("/symbols/0/filters")
            .and_then(|v| v.as_array())
            .and_then(|filters| filters.iter().find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE")))
            .and_then(|f| f.get("stepSize"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| anyhow::anyhow!("exchangeInfo response missing LOT_SIZE stepSize"))?;

        Ok(SymbolInfo { mark_price, qty_step })
    }

    #[instrument(skip(self, req), name = "venue_a::open_position")]
    async fn open_position(&self, req: &EntryRequest) -> Result<EntryResult> {
        let side = match req.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&leverage={}",
            req.symbol, side, req.quantity, req.leverage
        );
        if let Some(sl) = req.stop_loss_price {
            params.push_str(&format!("&stopLoss={sl}"));
        }
        if let Some(tp) = req.take_profit_price {
            params.push_str(&format!("&takeProfit={tp}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{qs}", self.base_url);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("open_position request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("open_position parse failed")?;
        if !status.is_success() {
            anyhow::bail!("venue A open_position returned {status}: {body}");
        }

        debug!(symbol = %req.symbol, "venue A entry placed atomically with protection");

        let order_id = body
            .get("orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let avg_price = body
            .get("avgPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok());
        let filled = body
            .get("executedQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok());

        // The atomic entry response carries the two child protective orders
        // it placed alongside the entry; the monitor needs both ids to tell
        // a live position from a closed one.
        let stop_loss_order_id = body.get("stopLossOrderId").map(|v| v.to_string());
        let take_profit_order_id = body.get("takeProfitOrderId").map(|v| v.to_string());

        Ok(EntryResult {
            entry: OrderAck {
                exchange_order_id: order_id,
                avg_price,
                filled_quantity: filled,
            },
            stop_loss_order_id,
            take_profit_order_id,
        })
    }

    #[instrument(skip(self), name = "venue_a::place_stop_loss")]
    async fn place_stop_loss(
        &self,
        _symbol: &str,
        _side: Side,
        _quantity: Decimal,
        _stop_price: Decimal,
        _position_mode: PositionMode,
    ) -> Result<OrderAck> {
        anyhow::bail!("venue A places protection atomically with the entry; no separate call needed")
    }

    #[instrument(skip(self), name = "venue_a::place_take_profit")]
    async fn place_take_profit(
        &self,
        _symbol: &str,
        _side: Side,
        _quantity: Decimal,
        _trigger_price: Decimal,
        _position_mode: PositionMode,
    ) -> Result<OrderAck> {
        anyhow::bail!("venue A places protection atomically with the entry; no separate call needed")
    }

    #[instrument(skip(self), name = "venue_a::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{qs}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("cancel_order request failed")?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Already filled or cancelled — tolerated, not an error.
            return Ok(());
        }
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            anyhow::bail!("venue A cancel_order returned {status}: {body}");
        }
        Ok(())
    }

    #[instrument(skip(self), name = "venue_a::get_order_status")]
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{qs}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("get_order_status request failed")?;
        let body: serde_json::Value = resp.json().await.context("get_order_status parse failed")?;
        let status_str = body.get("status").and_then(|v| v.as_str()).unwrap_or("");
        Ok(OrderStatus {
            exchange_order_id: order_id.to_string(),
            is_open: matches!(status_str, "NEW" | "PARTIALLY_FILLED"),
            is_filled: status_str == "FILLED",
        })
    }

    #[instrument(skip(self), name = "venue_a::get_open_order_ids")]
    async fn get_open_order_ids(&self, symbol: &str) -> Result<Vec<String>> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/openOrders?{qs}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("get_open_order_ids request failed")?;
        let body: Vec<serde_json::Value> =
            resp.json().await.context("get_open_order_ids parse failed")?;
        Ok(body
            .iter()
            .filter_map(|v| v.get("orderId").map(|id| id.to_string()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_impl_redacts_secret() {
        let client = AtomicVenueClient::new("key123", "secret456", "https://example.test");
        let printed = format!("{client:?}");
        assert!(!printed.contains("key123"));
        assert!(!printed.contains("secret456"));
    }

    #[test]
    fn signed_query_appends_signature() {
        let client = AtomicVenueClient::new("k", "s", "https://example.test");
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.contains("timestamp="));
        assert!(qs.contains("recvWindow=5000"));
        assert!(qs.contains("signature="));
    }
}
