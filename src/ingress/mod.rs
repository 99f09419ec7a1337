pub mod hmac;
pub mod webhook;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;

use crate::app_state::AppState;

/// Router for the webhook ingress surface, mounted at `/webhook/:url_path`
/// by `main.rs` alongside the admin/control API.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook/:url_path", post(webhook::receive_webhook))
}
