// =============================================================================
// Shared entity types for the signal broadcast engine
// =============================================================================
//
// Prices and quantities are decimal-exact (`rust_decimal::Decimal`); float is
// used only at exchange-adapter boundaries that hand back JSON numbers, and
// is converted to `Decimal` immediately on the way in.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    A,
    B,
    C,
    D,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
            Self::D => write!(f, "D"),
        }
    }
}

impl std::str::FromStr for Venue {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            other => anyhow::bail!("unknown venue '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    Hedge,
    OneWay,
}

impl Default for PositionMode {
    fn default() -> Self {
        // Default to hedge when the venue has not been probed yet.
        Self::Hedge
    }
}

impl std::fmt::Display for PositionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hedge => write!(f, "hedge"),
            Self::OneWay => write!(f, "one_way"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Futures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedDirections {
    BuyOnly,
    SellOnly,
    Both,
}

/// Normalized trade action after alias mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
    Close,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalExecutionStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for SignalExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    EndOfDay,
    GhostCleanupSync,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::Manual => write!(f, "manual"),
            Self::EndOfDay => write!(f, "end_of_day"),
            Self::GhostCleanupSync => write!(f, "ghost_cleanup_sync"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Info,
    Success,
    Warning,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeAccount {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub venue: Venue,
    /// Opaque at this layer — only `credentials::CredentialStore` decodes it.
    pub credentials: String,
    pub is_testnet: bool,
    pub is_active: bool,
    pub position_mode: Option<PositionMode>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubscriptionOverrides {
    pub leverage: Option<u32>,
    pub margin_usd: Option<Decimal>,
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRisk {
    pub max_daily_loss_usd: Decimal,
    pub max_concurrent_positions: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubscriptionCounters {
    pub current_daily_loss_usd: Decimal,
    pub current_positions: u32,
    pub total_pnl_usd: Decimal,
    pub win_count: u32,
    pub loss_count: u32,
    pub total_signals_received: u32,
    pub total_orders_executed: u32,
    pub total_orders_failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub exchange_account_id: Uuid,
    pub status: SubscriptionStatus,
    pub overrides: SubscriptionOverrides,
    pub risk: SubscriptionRisk,
    pub counters: SubscriptionCounters,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotDefaults {
    pub leverage: u32,
    pub margin_usd: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    pub name: String,
    pub defaults: BotDefaults,
    pub market_type: MarketType,
    pub allowed_directions: AllowedDirections,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub ticker: String,
    pub action: Action,
    pub source_ip: Option<String>,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_subscribers: Option<u32>,
    pub successful_executions: Option<u32>,
    pub failed_executions: Option<u32>,
    pub broadcast_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalExecution {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub exchange_account_id: Uuid,
    pub status: SignalExecutionStatus,
    pub exchange_order_id: Option<String>,
    pub executed_price: Option<Decimal>,
    pub executed_quantity: Option<Decimal>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub sl_price: Option<Decimal>,
    pub tp_price: Option<Decimal>,
    pub sl_order_status: Option<String>,
    pub tp_order_status: Option<String>,
    pub realized_pnl: Option<Decimal>,
    pub close_reason: Option<ExitReason>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub signal_execution_id: Option<Uuid>,
    pub exchange_account_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub entry_quantity: Decimal,
    pub entry_time: DateTime<Utc>,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub exit_price: Option<Decimal>,
    pub exit_quantity: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub pnl_usd: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub is_winner: Option<bool>,
    pub status: TradeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPnlSnapshot {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub snapshot_date: chrono::NaiveDate,
    pub daily_pnl_usd: Decimal,
    pub cumulative_pnl_usd: Decimal,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub cumulative_wins: u32,
    pub cumulative_losses: u32,
    pub win_rate_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub category: String,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Webhook config + delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub url_path: String,
    pub bot_id: Option<Uuid>,
    pub exchange_account_id: Option<Uuid>,
    pub secret: Option<String>,
    pub is_public: bool,
    pub is_active: bool,
    pub margin_usd: Decimal,
    pub leverage: u32,
    pub sl_pct: Decimal,
    pub tp_pct: Decimal,
    pub market_type: MarketType,
    pub error_threshold: u32,
    pub consecutive_errors: u32,
    pub total_deliveries: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDeliveryStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub status: WebhookDeliveryStatus,
    pub attempt: u32,
    pub signal_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
