// =============================================================================
// Error kinds (closed table, used for API responses and
// SignalExecution.error_code)
// =============================================================================
//
// Domain errors get a `thiserror` enum with a stable `code()` because callers
// (webhook responses, the REST control surface, the execution audit trail)
// need a closed string table, not just a human message. I/O and
// third-party boundary failures stay on `anyhow::Error` and are wrapped with
// `.context(...)` at the call site, same as the rest of this codebase.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HMAC signature invalid")]
    SignatureInvalid,

    #[error("request timestamp outside replay window")]
    Replay,

    #[error("webhook is inactive or paused")]
    WebhookInactive,

    #[error("direction blocked by bot configuration")]
    DirectionBlocked,

    #[error("daily loss cap reached for subscription")]
    DailyLossCap,

    #[error("max concurrent positions reached for subscription")]
    MaxPositions,

    #[error("exchange rate limit hit")]
    RateLimited,

    #[error("network error talking to exchange: {0}")]
    Network(String),

    #[error("symbol invalid or not tradable on venue: {0}")]
    SymbolInvalid(String),

    #[error("account position mode does not match order intent")]
    PositionModeMismatch,

    #[error("insufficient balance to open position")]
    InsufficientBalance,

    #[error("stop-loss/take-profit leg partially placed")]
    SlTpPartial,

    #[error("ghost trade detected during reconciliation")]
    GhostTrade,

    #[error("order quantity rounds to zero after lot-size normalization")]
    QtyTooSmall,
}

impl EngineError {
    /// Stable machine-readable code, used in API responses and persisted onto
    /// `SignalExecution.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::Replay => "REPLAY",
            Self::WebhookInactive => "WEBHOOK_INACTIVE",
            Self::DirectionBlocked => "DIRECTION_BLOCKED",
            Self::DailyLossCap => "DAILY_LOSS_CAP",
            Self::MaxPositions => "MAX_POSITIONS",
            Self::RateLimited => "RATE_LIMITED",
            Self::Network(_) => "NETWORK",
            Self::SymbolInvalid(_) => "SYMBOL_INVALID",
            Self::PositionModeMismatch => "POSITION_MODE_MISMATCH",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::SlTpPartial => "SL_TP_PARTIAL",
            Self::GhostTrade => "GHOST_TRADE",
            Self::QtyTooSmall => "QTY_TOO_SMALL",
        }
    }

    /// Whether a retry against the same venue is expected to help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_closed_table() {
        assert_eq!(EngineError::SignatureInvalid.code(), "SIGNATURE_INVALID");
        assert_eq!(EngineError::Replay.code(), "REPLAY");
        assert_eq!(EngineError::GhostTrade.code(), "GHOST_TRADE");
    }

    #[test]
    fn retryable_kinds() {
        assert!(EngineError::RateLimited.is_retryable());
        assert!(EngineError::Network("timeout".into()).is_retryable());
        assert!(!EngineError::DailyLossCap.is_retryable());
    }
}
