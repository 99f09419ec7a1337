// =============================================================================
// Webhook ingestion
// =============================================================================
//
// The HTTP surface always answers 200 to the sender — most alert services
// stop retrying (or flag the webhook as broken) on a non-2xx response, so
// failures are recorded internally via the `WebhookDelivery` state machine
// instead of surfaced as an HTTP error. Ticker/action aliasing normalizes
// the wide variety of alert message spellings, including non-English
// long/short synonyms, down to the engine's canonical `Action`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broadcast;
use crate::cache::cooldown_key;
use crate::ingress::hmac;
use crate::types::{Action, Signal, WebhookDelivery, WebhookDeliveryStatus};

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub webhook_id: Option<Uuid>,
    pub delivery_id: Option<Uuid>,
    pub orders_created: u32,
    pub orders_executed: u32,
    pub orders_failed: u32,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResponse {
    fn failure(error: impl Into<String>, webhook_id: Option<Uuid>, delivery_id: Option<Uuid>, started: std::time::Instant) -> Self {
        Self {
            success: false,
            webhook_id,
            delivery_id,
            orders_created: 0,
            orders_executed: 0,
            orders_failed: 0,
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "symbol")]
    pub ticker: String,
    pub action: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Map the wide variety of alert-provider action spellings to a canonical
/// `Action`. Includes the long/short and Portuguese synonyms the original
/// alert source accepted.
fn normalize_action(raw: &str) -> Option<Action> {
    match raw.to_ascii_lowercase().as_str() {
        "buy" | "long" | "comprar" | "compra" => Some(Action::Buy),
        "sell" | "short" | "vender" | "venda" => Some(Action::Sell),
        "close" | "exit" | "fechar" | "encerrar" => Some(Action::Close),
        _ => None,
    }
}

fn normalize_ticker(raw: &str) -> String {
    raw.trim().to_ascii_uppercase().replace(['-', '_', '/', '.'], "")
}

pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(url_path): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let started = std::time::Instant::now();
    let response = match handle(&state, &url_path, &headers, &body, started).await {
        Ok(response) => response,
        Err(e) => {
            warn!(url_path, error = %e, "webhook delivery failed internally");
            WebhookResponse::failure(e.to_string(), None, None, started)
        }
    };
    // Always 200 — per-delivery outcome lives in webhook_deliveries, not
    // the HTTP status, so the sender never stops retrying or disables us.
    (StatusCode::OK, Json(response))
}

async fn handle(
    state: &Arc<AppState>,
    url_path: &str,
    headers: &HeaderMap,
    raw_body: &[u8],
    started: std::time::Instant,
) -> anyhow::Result<WebhookResponse> {
    let webhook = state
        .db
        .get_webhook_by_path(url_path)
        .await?
        .ok_or_else(|| anyhow::anyhow!("unknown webhook path '{url_path}'"))?;

    let delivery_id = Uuid::new_v4();
    let mut delivery = WebhookDelivery {
        id: delivery_id,
        webhook_id: webhook.id,
        status: WebhookDeliveryStatus::Processing,
        attempt: 1,
        signal_id: None,
        error_message: None,
        created_at: Utc::now(),
        completed_at: None,
    };
    state.db.insert_webhook_delivery(&delivery).await?;

    if !webhook.is_active {
        return fail_delivery(state, &mut delivery, webhook.id, "webhook is inactive or auto-paused", started).await;
    }

    if let Some(secret) = webhook.secret.as_deref() {
        let sig_header = headers
            .get("X-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let ts = headers
            .get("X-Timestamp")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or_else(|| Utc::now().timestamp());

        let tolerance = state.config.read().signature_tolerance_sec;
        if let Err(e) = hmac::verify(secret, raw_body, sig_header, ts, tolerance) {
            return fail_delivery(state, &mut delivery, webhook.id, &e.to_string(), started).await;
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(raw_body) {
        Ok(p) => p,
        Err(e) => {
            return fail_delivery(state, &mut delivery, webhook.id, &format!("malformed payload: {e}"), started).await
        }
    };

    let ticker = normalize_ticker(&payload.ticker);
    let action = match normalize_action(&payload.action) {
        Some(a) => a,
        None => {
            return fail_delivery(
                state,
                &mut delivery,
                webhook.id,
                &format!("unrecognized action '{}'", payload.action),
                started,
            )
            .await
        }
    };

    let Some(bot_id) = webhook.bot_id else {
        return fail_delivery(state, &mut delivery, webhook.id, "webhook has no bot configured", started).await;
    };

    let cooldown_minutes = state.config.read().signal_cooldown_minutes;
    let key = cooldown_key(bot_id, &ticker, &action.to_string());
    let claimed = state.cooldown_cache.try_claim(
        key,
        (),
        std::time::Duration::from_secs((cooldown_minutes * 60).max(0) as u64),
    );
    if !claimed {
        info!(ticker, %action, "duplicate signal within cooldown window; skipped");
        delivery.status = WebhookDeliveryStatus::Success;
        delivery.completed_at = Some(Utc::now());
        state
            .db
            .update_webhook_delivery_status(delivery_id, WebhookDeliveryStatus::Success, 1, None)
            .await?;
        state.db.record_webhook_outcome(webhook.id, true).await?;
        return Ok(WebhookResponse {
            success: true,
            webhook_id: Some(webhook.id),
            delivery_id: Some(delivery_id),
            orders_created: 0,
            orders_executed: 0,
            orders_failed: 0,
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: None,
        });
    }

    let signal = Signal {
        id: Uuid::new_v4(),
        bot_id,
        ticker: ticker.clone(),
        action,
        source_ip: headers
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        raw_payload: serde_json::from_slice(raw_body).unwrap_or(serde_json::Value::Null),
        created_at: Utc::now(),
        completed_at: None,
        total_subscribers: None,
        successful_executions: None,
        failed_executions: None,
        broadcast_duration_ms: None,
    };
    state.db.insert_signal(&signal).await?;
    delivery.signal_id = Some(signal.id);

    let subscriptions = state.db.list_active_subscriptions_for_bot(bot_id).await?;
    let eligible = broadcast::filter_eligible(subscriptions, action);

    let state_clone = state.clone();
    let signal_clone = signal.clone();
    let summary = broadcast::broadcast_signal(state_clone, signal_clone, eligible).await;

    state
        .db
        .complete_signal(
            signal.id,
            summary.total_subscribers,
            summary.successful,
            summary.failed,
            summary.duration_ms,
        )
        .await?;

    delivery.status = WebhookDeliveryStatus::Success;
    delivery.completed_at = Some(Utc::now());
    state
        .db
        .update_webhook_delivery_status(delivery_id, WebhookDeliveryStatus::Success, 1, None)
        .await?;
    state.db.record_webhook_outcome(webhook.id, true).await?;

    state.increment_version();
    Ok(WebhookResponse {
        success: true,
        webhook_id: Some(webhook.id),
        delivery_id: Some(delivery_id),
        orders_created: summary.total_subscribers,
        orders_executed: summary.successful,
        orders_failed: summary.failed,
        processing_time_ms: started.elapsed().as_millis() as u64,
        error: None,
    })
}

async fn fail_delivery(
    state: &Arc<AppState>,
    delivery: &mut WebhookDelivery,
    webhook_id: Uuid,
    message: &str,
    started: std::time::Instant,
) -> anyhow::Result<WebhookResponse> {
    delivery.status = WebhookDeliveryStatus::Failed;
    delivery.error_message = Some(message.to_string());
    delivery.completed_at = Some(Utc::now());
    state
        .db
        .update_webhook_delivery_status(delivery.id, WebhookDeliveryStatus::Failed, delivery.attempt, Some(message))
        .await?;
    let (_, paused) = state.db.record_webhook_outcome(webhook_id, false).await?;
    if paused {
        warn!(%webhook_id, "webhook auto-paused after exceeding consecutive error threshold");
        notify_owner_of_pause(state, webhook_id).await;
    }
    state.push_error(message.to_string(), None);
    Ok(WebhookResponse::failure(
        message.to_string(),
        Some(webhook_id),
        Some(delivery.id),
        started,
    ))
}

/// Best-effort: look up the account behind the webhook and notify its owner
/// that delivery has auto-paused. A lookup failure here shouldn't fail the
/// delivery itself, so errors are logged and swallowed.
async fn notify_owner_of_pause(state: &Arc<AppState>, webhook_id: Uuid) {
    let result = async {
        let webhook = state
            .db
            .get_webhook(webhook_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("webhook {webhook_id} vanished"))?;
        let Some(account_id) = webhook.exchange_account_id else {
            return Ok(());
        };
        let Some(account) = state.db.get_exchange_account(account_id).await? else {
            return Ok(());
        };
        crate::notifications::notify(
            state,
            account.owner_user_id,
            crate::types::NotificationType::Warning,
            "webhook_paused",
            "Webhook auto-paused",
            &format!("Webhook {webhook_id} was auto-paused after exceeding its consecutive error threshold."),
        )
        .await
    }
    .await;

    if let Err(e) = result {
        warn!(%webhook_id, error = %e, "failed to notify owner of webhook auto-pause");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_buy_synonyms_including_portuguese() {
        assert_eq!(normalize_action("BUY"), Some(Action::Buy));
        assert_eq!(normalize_action("long"), Some(Action::Buy));
        assert_eq!(normalize_action("comprar"), Some(Action::Buy));
    }

    #[test]
    fn normalizes_sell_and_close_synonyms() {
        assert_eq!(normalize_action("short"), Some(Action::Sell));
        assert_eq!(normalize_action("vender"), Some(Action::Sell));
        assert_eq!(normalize_action("fechar"), Some(Action::Close));
        assert_eq!(normalize_action("exit"), Some(Action::Close));
    }

    #[test]
    fn rejects_unknown_action() {
        assert_eq!(normalize_action("frobnicate"), None);
    }

    #[test]
    fn ticker_normalization_strips_separators_and_uppercases() {
        assert_eq!(normalize_ticker("btc-usdt"), "BTCUSDT");
        assert_eq!(normalize_ticker(" eth_usdt "), "ETHUSDT");
        assert_eq!(normalize_ticker("sol/usdt"), "SOLUSDT");
    }
}
