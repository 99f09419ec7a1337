// =============================================================================
// Central Application State
// =============================================================================
//
// Ties every subsystem together behind `Arc<AppState>`: atomic version
// counter for change detection, a bounded ring buffer of recent errors for
// the admin surface, and `Arc` handles to subsystems that manage their own
// interior mutability. There is no market-data/regime/indicator surface —
// this engine has no strategy layer of its own, only signal relay.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::TtlCache;
use crate::config::RuntimeConfig;
use crate::credentials::CredentialStore;
use crate::db::PersistenceGateway;
use crate::exchange::ExchangeAdapter;
use crate::types::Venue;

const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// Lookup table from venue to its configured exchange adapter. Built once at
/// startup from the accounts on file; a venue absent here simply has no
/// account configured yet.
pub struct ExchangeRegistry {
    adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ExchangeAdapter>) {
        self.adapters.insert(adapter.venue(), adapter);
    }

    pub fn get(&self, venue: Venue) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(&venue).cloned()
    }
}

impl Default for ExchangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// mutation so polling admin clients can detect change cheaply.
    pub state_version: AtomicU64,

    pub config: RwLock<RuntimeConfig>,
    pub db: PersistenceGateway,
    pub credentials: CredentialStore,
    pub exchange_registry: ExchangeRegistry,

    /// Idempotency keys for client-initiated SL/TP mutations, caching the
    /// exact response body returned the first time so a retried request
    /// gets a byte-identical reply instead of re-executing the mutation.
    pub idempotency_cache: TtlCache<serde_json::Value>,
    /// Signal cooldown keys, keyed by `cache::cooldown_key(...)`.
    pub cooldown_cache: TtlCache<()>,

    recent_errors: RwLock<VecDeque<ErrorRecord>>,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        db: PersistenceGateway,
        credentials: CredentialStore,
        exchange_registry: ExchangeRegistry,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(0),
            config: RwLock::new(config),
            db,
            credentials,
            exchange_registry,
            idempotency_cache: TtlCache::new(),
            cooldown_cache: TtlCache::new(),
            recent_errors: RwLock::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn push_error(&self, message: impl Into<String>, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            message: message.into(),
            code,
            at: Utc::now().to_rfc3339(),
        });
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_log_is_bounded() {
        // Exercise the ring-buffer bound directly against recent_errors,
        // without needing a full AppState (no async runtime required here).
        let errors: RwLock<VecDeque<ErrorRecord>> = RwLock::new(VecDeque::with_capacity(MAX_RECENT_ERRORS));
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            let mut guard = errors.write();
            if guard.len() >= MAX_RECENT_ERRORS {
                guard.pop_front();
            }
            guard.push_back(ErrorRecord {
                message: format!("err {i}"),
                code: None,
                at: Utc::now().to_rfc3339(),
            });
        }
        assert_eq!(errors.read().len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.read().front().unwrap().message, "err 10");
    }
}
