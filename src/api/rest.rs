// =============================================================================
// REST API — admin/control surface (Axum 0.7)
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. Everything else requires a valid Bearer token via the
// `AuthBearer` extractor. The actual signal path is `ingress::router()`,
// mounted separately in `main.rs`; this router only covers operator/admin
// actions: health, state introspection, webhook pause/resume, trade
// history, and the client-facing SL/TP mutation endpoint.
//
// CORS is configured permissively, matching how this codebase's other
// service-facing routers are set up; tighten `allowed_origins` for a
// production deployment fronted by a browser client.

use std::sync::Arc;

use axum::extract::{Json, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::exchange::opposite_side;

pub fn router() -> Router<Arc<AppState>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/webhooks/:id/pause", post(pause_webhook))
        .route("/api/v1/webhooks/:id/resume", post(resume_webhook))
        .route("/api/v1/trades", get(trade_journal))
        .route("/api/v1/sltp", post(mutate_sl_tp))
        .layer(cors)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// State snapshot (authenticated)
// =============================================================================

#[derive(Serialize)]
struct StateSnapshot {
    state_version: u64,
    recent_errors: Vec<crate::app_state::ErrorRecord>,
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StateSnapshot {
        state_version: state.current_version(),
        recent_errors: state.recent_errors(),
    })
}

// =============================================================================
// Webhook pause/resume (authenticated)
// =============================================================================

#[derive(Serialize)]
struct WebhookControlResponse {
    webhook_id: Uuid,
    is_active: bool,
}

async fn pause_webhook(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    require_webhook(&state, id).await?;
    state
        .db
        .set_webhook_active(id, false)
        .await
        .map_err(internal_error)?;
    state.increment_version();
    info!(webhook_id = %id, "webhook paused via admin API");
    Ok(Json(WebhookControlResponse {
        webhook_id: id,
        is_active: false,
    }))
}

async fn resume_webhook(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    require_webhook(&state, id).await?;
    state
        .db
        .set_webhook_active(id, true)
        .await
        .map_err(internal_error)?;
    state.increment_version();
    info!(webhook_id = %id, "webhook resumed via admin API");
    Ok(Json(WebhookControlResponse {
        webhook_id: id,
        is_active: true,
    }))
}

async fn require_webhook(state: &Arc<AppState>, id: Uuid) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    match state.db.get_webhook(id).await.map_err(internal_error)? {
        Some(_) => Ok(()),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("webhook {id} not found") })),
        )),
    }
}

// =============================================================================
// Trade journal (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct TradeJournalQuery {
    user_id: Uuid,
    #[serde(default = "default_trade_journal_limit")]
    limit: u32,
}

fn default_trade_journal_limit() -> u32 {
    100
}

async fn trade_journal(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradeJournalQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let trades = state
        .db
        .list_recent_trades_for_user(query.user_id, query.limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(trades))
}

// =============================================================================
// Client SL/TP mutation (authenticated, idempotent)
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum SlTpKind {
    StopLoss,
    TakeProfit,
}

#[derive(Deserialize)]
struct SlTpMutationRequest {
    trade_id: Uuid,
    kind: SlTpKind,
    /// New trigger price. Omitting this cancels the leg instead of moving it.
    price: Option<Decimal>,
}

#[derive(Serialize, Clone)]
struct SlTpMutationResponse {
    trade_id: Uuid,
    order_id: Option<String>,
    cancelled: bool,
}

/// Move, create, or cancel a trade's stop-loss or take-profit leg.
/// `X-Idempotency-Key` is required; a repeated key within the configured TTL
/// returns the cached response byte-for-byte instead of re-executing the
/// mutation against the exchange.
async fn mutate_sl_tp(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SlTpMutationRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let idempotency_key = headers
        .get("X-Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "X-Idempotency-Key header is required" })),
            )
        })?
        .to_string();

    if let Some(cached) = state.idempotency_cache.get(&idempotency_key) {
        return Ok((StatusCode::OK, Json(cached)));
    }

    let ttl_sec = state.config.read().idempotency_ttl_sec;

    let response = execute_sl_tp_mutation(&state, &req).await.map_err(internal_error)?;
    let response_value = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);

    state.idempotency_cache.insert(
        idempotency_key,
        response_value.clone(),
        std::time::Duration::from_secs(ttl_sec),
    );

    Ok((StatusCode::OK, Json(response_value)))
}

async fn execute_sl_tp_mutation(
    state: &Arc<AppState>,
    req: &SlTpMutationRequest,
) -> anyhow::Result<SlTpMutationResponse> {
    let all_open = state.db.list_all_open_trades().await?;
    let trade = all_open
        .into_iter()
        .find(|t| t.id == req.trade_id)
        .ok_or_else(|| anyhow::anyhow!("trade {} is not open", req.trade_id))?;

    let account = state
        .db
        .get_exchange_account(trade.exchange_account_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("exchange account {} not found", trade.exchange_account_id))?;
    let adapter = state
        .exchange_registry
        .get(account.venue)
        .ok_or_else(|| anyhow::anyhow!("no adapter registered for venue {}", account.venue))?;

    let existing_order_id = match req.kind {
        SlTpKind::StopLoss => trade.sl_order_id.clone(),
        SlTpKind::TakeProfit => trade.tp_order_id.clone(),
    };

    if let Some(order_id) = existing_order_id.as_deref() {
        adapter.cancel_order(&trade.symbol, order_id).await?;
    }

    let close_side = opposite_side(trade.side);
    let position_mode = account.position_mode.unwrap_or_else(|| {
        state
            .credentials
            .cached_position_mode(account.id)
            .unwrap_or_default()
    });

    let new_order_id = match req.price {
        None => None,
        Some(price) => {
            let ack = match req.kind {
                SlTpKind::StopLoss => {
                    adapter
                        .place_stop_loss(&trade.symbol, close_side, trade.entry_quantity, price, position_mode)
                        .await?
                }
                SlTpKind::TakeProfit => {
                    adapter
                        .place_take_profit(&trade.symbol, close_side, trade.entry_quantity, price, position_mode)
                        .await?
                }
            };
            Some(ack.exchange_order_id)
        }
    };

    let column = match req.kind {
        SlTpKind::StopLoss => "sl_order_id",
        SlTpKind::TakeProfit => "tp_order_id",
    };
    state.db.update_trade_leg_order_id(trade.id, column, new_order_id.as_deref()).await?;
    state.increment_version();

    if existing_order_id.is_some() && new_order_id.is_none() {
        warn!(trade_id = %trade.id, kind = column, "protective leg cancelled via admin API with no replacement");
    }

    Ok(SlTpMutationResponse {
        trade_id: trade.id,
        order_id: new_order_id,
        cancelled: req.price.is_none(),
    })
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::{AppState, ExchangeRegistry};
    use crate::config::RuntimeConfig;
    use crate::credentials::CredentialStore;
    use crate::db::PersistenceGateway;
    use crate::exchange::{EntryRequest, EntryResult, ExchangeAdapter, OrderAck, OrderStatus, SymbolInfo};
    use crate::types::{Direction, PositionMode, Trade, TradeStatus, Venue};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    /// Records every `cancel_order`/`place_stop_loss`/`place_take_profit`
    /// call it receives instead of talking to a real venue, so the mutation
    /// handler's side effects can be asserted directly.
    #[derive(Default)]
    struct FakeAdapter {
        cancelled: Mutex<Vec<String>>,
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
            unimplemented!("not exercised by this test")
        }

        async fn open_position(&self, _req: &EntryRequest) -> anyhow::Result<EntryResult> {
            unimplemented!("not exercised by this test")
        }

        async fn place_stop_loss(
            &self,
            _symbol: &str,
            _side: crate::types::Side,
            _quantity: Decimal,
            _stop_price: Decimal,
            _position_mode: PositionMode,
        ) -> anyhow::Result<OrderAck> {
            Ok(OrderAck {
                exchange_order_id: "new-sl-order".to_string(),
                avg_price: None,
                filled_quantity: None,
            })
        }

        async fn place_take_profit(
            &self,
            _symbol: &str,
            _side: crate::types::Side,
            _quantity: Decimal,
            _trigger_price: Decimal,
            _position_mode: PositionMode,
        ) -> anyhow::Result<OrderAck> {
            unimplemented!("not exercised by this test")
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> anyhow::Result<()> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(())
        }

        async fn get_order_status(&self, _symbol: &str, _order_id: &str) -> anyhow::Result<OrderStatus> {
            unimplemented!("not exercised by this test")
        }

        async fn get_open_order_ids(&self, _symbol: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
    }

    async fn seed_account_and_trade(db: &PersistenceGateway) -> (Uuid, Trade) {
        let user_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let sub_id = Uuid::new_v4();
        let bot_id = Uuid::new_v4();

        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, 'u@test', ?)")
            .bind(user_id.to_string())
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO exchange_accounts (id, owner_user_id, venue, credentials, created_at)
             VALUES (?, ?, 'A', 'x', ?)",
        )
        .bind(account_id.to_string())
        .bind(user_id.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO bots (id, name, default_leverage, default_margin_usd, default_sl_pct,
                default_tp_pct, market_type, allowed_directions, created_at)
             VALUES (?, 'demo', 5, '100', '1.5', '3.0', 'futures', 'both', ?)",
        )
        .bind(bot_id.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
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
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();

        let trade = Trade {
            id: Uuid::new_v4(),
            subscription_id: sub_id,
            user_id,
            signal_execution_id: None,
            exchange_account_id: account_id,
            symbol: "BTCUSDT".into(),
            side: crate::types::Side::Buy,
            direction: Direction::Long,
            entry_price: dec!(50000),
            entry_quantity: dec!(0.1),
            entry_time: chrono::Utc::now(),
            sl_order_id: Some("old-sl-order".to_string()),
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
        db.insert_trade(&trade).await.unwrap();
        (account_id, trade)
    }

    #[tokio::test]
    async fn sl_mutation_cancels_old_leg_and_persists_new_order_id() {
        let db = PersistenceGateway::connect_in_memory().await.unwrap();
        let (_account_id, trade) = seed_account_and_trade(&db).await;

        let adapter = Arc::new(FakeAdapter::default());
        let mut registry = ExchangeRegistry::new();
        registry.register(adapter.clone());

        let state = Arc::new(AppState::new(
            RuntimeConfig::default(),
            db,
            CredentialStore::new(),
            registry,
        ));

        let response = execute_sl_tp_mutation(
            &state,
            &SlTpMutationRequest {
                trade_id: trade.id,
                kind: SlTpKind::StopLoss,
                price: Some(dec!(48000)),
            },
        )
        .await
        .unwrap();

        assert_eq!(adapter.cancelled.lock().as_slice(), ["old-sl-order"]);
        assert_eq!(response.order_id.as_deref(), Some("new-sl-order"));
        assert!(!response.cancelled);

        let reloaded = state
            .db
            .list_all_open_trades()
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.id == trade.id)
            .unwrap();
        assert_eq!(reloaded.sl_order_id.as_deref(), Some("new-sl-order"));
    }

    #[tokio::test]
    async fn sl_mutation_with_no_price_cancels_without_replacing() {
        let db = PersistenceGateway::connect_in_memory().await.unwrap();
        let (_account_id, trade) = seed_account_and_trade(&db).await;

        let adapter = Arc::new(FakeAdapter::default());
        let mut registry = ExchangeRegistry::new();
        registry.register(adapter.clone());

        let state = Arc::new(AppState::new(
            RuntimeConfig::default(),
            db,
            CredentialStore::new(),
            registry,
        ));

        let response = execute_sl_tp_mutation(
            &state,
            &SlTpMutationRequest {
                trade_id: trade.id,
                kind: SlTpKind::StopLoss,
                price: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(adapter.cancelled.lock().as_slice(), ["old-sl-order"]);
        assert_eq!(response.order_id, None);
        assert!(response.cancelled);
    }
}
