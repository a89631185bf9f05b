// crates/relay/src/listener.rs
//! Receives `job_updates` from the coordination store and routes each
//! message to local sockets. Resubscribes with exponential backoff when the
//! subscription fails or ends.

use std::time::Duration;

use futures_util::StreamExt;
use jobpulse_types::JOB_UPDATES_CHANNEL;
use tokio::task::JoinHandle;

use crate::state::RelayState;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub fn spawn_update_listener(state: RelayState) -> JoinHandle<()> {
    tokio::spawn(run_update_listener(state))
}

pub async fn run_update_listener(state: RelayState) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match state.store.subscribe(JOB_UPDATES_CHANNEL).await {
            Ok(mut messages) => {
                tracing::info!(channel = JOB_UPDATES_CHANNEL, "subscribed to job updates");
                backoff = INITIAL_BACKOFF;
                while let Some(raw) = messages.next().await {
                    state.handle_raw_update(&raw);
                }
                tracing::warn!(
                    backoff_secs = backoff.as_secs(),
                    "job update subscription ended; resubscribing"
                );
            }
            Err(e) => {
                tracing::warn!(backoff_secs = backoff.as_secs(), "job update subscription failed: {e}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
