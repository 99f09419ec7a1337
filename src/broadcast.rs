// =============================================================================
// Broadcast Fan-out
// =============================================================================
//
// Fans an incoming signal out to every active subscription on the bot as an
// independent `tokio::spawn` task. There is no cross-task deadline: a slow
// exchange call for subscriber X never delays subscriber Y's fill. Results
// are collected back through a `JoinSet` and aggregated into the signal's
// summary counters once every task has finished.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::app_state::AppState;
use crate::types::{Action, Signal, SignalExecutionStatus, Subscription};

pub struct BroadcastSummary {
    pub total_subscribers: u32,
    pub successful: u32,
    pub failed: u32,
    pub duration_ms: u64,
}

/// Broadcast `signal` to every active subscription on its bot, executing
/// each in its own task so one slow or failing subscriber can't stall the
/// rest.
#[instrument(skip(state, signal, subscriptions), fields(signal_id = %signal.id))]
pub async fn broadcast_signal(
    state: Arc<AppState>,
    signal: Signal,
    subscriptions: Vec<Subscription>,
) -> BroadcastSummary {
    let started = std::time::Instant::now();
    let total = subscriptions.len() as u32;

    let mut tasks = JoinSet::new();
    for sub in subscriptions {
        let state = state.clone();
        let signal = signal.clone();
        tasks.spawn(async move { execute_for_subscription(state, signal, sub).await });
    }

    let mut successful = 0u32;
    let mut failed = 0u32;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(SignalExecutionStatus::Success) => successful += 1,
            Ok(SignalExecutionStatus::Skipped) => {}
            Ok(_) => failed += 1,
            Err(e) => {
                warn!(signal_id = %signal.id, error = %e, "subscription execution task panicked");
                failed += 1;
            }
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    info!(
        signal_id = %signal.id,
        total_subscribers = total,
        successful,
        failed,
        duration_ms,
        "broadcast complete"
    );

    BroadcastSummary {
        total_subscribers: total,
        successful,
        failed,
        duration_ms,
    }
}

async fn execute_for_subscription(
    state: Arc<AppState>,
    signal: Signal,
    sub: Subscription,
) -> SignalExecutionStatus {
    match crate::signal_pipeline::execute_signal_for_subscription(&state, &signal, &sub).await {
        Ok(status) => status,
        Err(e) => {
            warn!(subscription_id = %sub.id, signal_id = %signal.id, error = %e, "signal execution failed");
            SignalExecutionStatus::Failed
        }
    }
}

/// Matches the action against the subscription's owning bot before
/// broadcasting — used by the ingress layer to skip subscriptions whose
/// bot direction already blocks this action, so those don't even spawn a
/// task (cheaper than letting the risk gate reject them one by one).
pub fn filter_eligible(subscriptions: Vec<Subscription>, _action: Action) -> Vec<Subscription> {
    subscriptions
        .into_iter()
        .filter(|s| s.status == crate::types::SubscriptionStatus::Active)
        .collect()
}
