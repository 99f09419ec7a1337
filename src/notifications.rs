// =============================================================================
// Notifications
// =============================================================================
//
// Thin wrapper around persisting a `Notification` row and bumping the state
// version so polling admin clients pick it up. `trade_tracker` and the
// webhook auto-pause path construct `Notification` values directly where
// they already have all the fields to hand; this module exists for the
// handful of callers (scheduler, admin API) that only have a category and a
// message and don't want to build the struct by hand each time.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::types::{Notification, NotificationType};

pub async fn notify(
    state: &Arc<AppState>,
    user_id: Uuid,
    kind: NotificationType,
    category: &str,
    title: &str,
    message: &str,
) -> anyhow::Result<()> {
    let notification = Notification {
        id: Uuid::new_v4(),
        user_id,
        kind,
        category: category.to_string(),
        title: title.to_string(),
        message: message.to_string(),
        metadata: None,
        created_at: Utc::now(),
    };
    state.db.insert_notification(&notification).await?;
    state.increment_version();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::ExchangeRegistry;
    use crate::config::RuntimeConfig;
    use crate::credentials::CredentialStore;
    use crate::db::PersistenceGateway;

    #[tokio::test]
    async fn notify_inserts_a_row_and_bumps_state_version() {
        let db = PersistenceGateway::connect_in_memory().await.unwrap();
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, 'u@test', ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(db.pool())
            .await
            .unwrap();

        let state = std::sync::Arc::new(AppState::new(
            RuntimeConfig::default(),
            db,
            CredentialStore::new(),
            ExchangeRegistry::new(),
        ));
        let before = state.current_version();

        notify(
            &state,
            Uuid::new_v4(),
            NotificationType::Info,
            "test",
            "hello",
            "world",
        )
        .await
        .unwrap();

        assert_eq!(state.current_version(), before + 1);
    }
}
