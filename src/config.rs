// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable lives here so the engine can be reconfigured without a
// restart. Persistence uses the same atomic tmp + rename pattern the
// original config module used: every field carries `#[serde(default)]` so a
// config file missing newer fields still loads.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_sync_interval_default_sec() -> u64 {
    30
}

fn default_sync_interval_venue_tight_sec() -> u64 {
    60
}

fn default_signature_tolerance_sec() -> i64 {
    300
}

fn default_webhook_max_retries() -> u32 {
    3
}

fn default_webhook_retry_delays_sec() -> Vec<u64> {
    vec![5, 30, 120]
}

fn default_webhook_error_threshold() -> u32 {
    10
}

fn default_signal_cooldown_minutes() -> i64 {
    5
}

fn default_order_retry_max_attempts() -> u32 {
    3
}

fn default_order_retry_backoff_sec() -> Vec<u64> {
    vec![1, 2, 5]
}

fn default_idempotency_ttl_sec() -> u64 {
    60
}

fn default_daily_report_hour_utc() -> u32 {
    0
}

fn default_monitor_tick_sec() -> u64 {
    5
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the signal broadcast engine.
///
/// Every field has a serde default so older JSON configs missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default polling interval for the per-account sync loop.
    #[serde(default = "default_sync_interval_default_sec")]
    pub sync_interval_default_sec: u64,

    /// Wider minimum spacing between syncs for venues with tighter rate budgets.
    #[serde(default = "default_sync_interval_venue_tight_sec")]
    pub sync_interval_venue_tight_sec: u64,

    /// Acceptable clock skew for webhook HMAC timestamps, in seconds.
    #[serde(default = "default_signature_tolerance_sec")]
    pub signature_tolerance_sec: i64,

    /// Maximum webhook delivery attempts before giving up.
    #[serde(default = "default_webhook_max_retries")]
    pub webhook_max_retries: u32,

    /// Delay before each webhook retry attempt, indexed by attempt number.
    #[serde(default = "default_webhook_retry_delays_sec")]
    pub webhook_retry_delays_sec: Vec<u64>,

    /// Consecutive webhook failures before auto-pausing the webhook.
    #[serde(default = "default_webhook_error_threshold")]
    pub webhook_error_threshold: u32,

    /// Minimum gap between identical signals before the second is treated as
    /// a duplicate and skipped.
    #[serde(default = "default_signal_cooldown_minutes")]
    pub signal_cooldown_minutes: i64,

    /// Maximum attempts when placing an order against an exchange adapter.
    #[serde(default = "default_order_retry_max_attempts")]
    pub order_retry_max_attempts: u32,

    /// Backoff delay, in seconds, indexed by order retry attempt.
    #[serde(default = "default_order_retry_backoff_sec")]
    pub order_retry_backoff_sec: Vec<u64>,

    /// TTL for cached idempotency keys on client-initiated mutations.
    #[serde(default = "default_idempotency_ttl_sec")]
    pub idempotency_ttl_sec: u64,

    /// UTC hour at which the daily maintenance window (P&L snapshot roll,
    /// counter reset) runs.
    #[serde(default = "default_daily_report_hour_utc")]
    pub daily_report_hour_utc: u32,

    /// Tick interval for the SL/TP reconciliation monitor.
    #[serde(default = "default_monitor_tick_sec")]
    pub monitor_tick_sec: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sync_interval_default_sec: default_sync_interval_default_sec(),
            sync_interval_venue_tight_sec: default_sync_interval_venue_tight_sec(),
            signature_tolerance_sec: default_signature_tolerance_sec(),
            webhook_max_retries: default_webhook_max_retries(),
            webhook_retry_delays_sec: default_webhook_retry_delays_sec(),
            webhook_error_threshold: default_webhook_error_threshold(),
            signal_cooldown_minutes: default_signal_cooldown_minutes(),
            order_retry_max_attempts: default_order_retry_max_attempts(),
            order_retry_backoff_sec: default_order_retry_backoff_sec(),
            idempotency_ttl_sec: default_idempotency_ttl_sec(),
            daily_report_hour_utc: default_daily_report_hour_utc(),
            monitor_tick_sec: default_monitor_tick_sec(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename), so a crash mid-write never leaves a
    /// corrupt config behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.sync_interval_default_sec, 30);
        assert_eq!(cfg.signature_tolerance_sec, 300);
        assert_eq!(cfg.webhook_retry_delays_sec, vec![5, 30, 120]);
        assert_eq!(cfg.idempotency_ttl_sec, 60);
        assert_eq!(cfg.monitor_tick_sec, 5);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.webhook_max_retries, 3);
        assert_eq!(cfg.signal_cooldown_minutes, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "monitor_tick_sec": 2 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.monitor_tick_sec, 2);
        assert_eq!(cfg.sync_interval_default_sec, 30);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.sync_interval_default_sec, cfg2.sync_interval_default_sec);
        assert_eq!(cfg.webhook_retry_delays_sec, cfg2.webhook_retry_delays_sec);
    }

    #[test]
    fn save_then_load_roundtrips_via_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let cfg = RuntimeConfig::default();
        cfg.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.sync_interval_default_sec, cfg.sync_interval_default_sec);
    }
}
