// crates/core/src/publish.rs
//! Producer side of the `job_updates` channel.

use jobpulse_store::SharedStore;
use jobpulse_types::{UpdateEnvelope, JOB_UPDATES_CHANNEL};
use serde_json::Value;

use crate::error::CoreResult;

#[derive(Clone)]
pub struct JobUpdatePublisher {
    store: SharedStore,
}

impl JobUpdatePublisher {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Wrap `payload` for `team_id` and publish it. Updates without a team
    /// have no audience and are dropped; returns whether anything was sent.
    pub async fn publish(&self, team_id: &str, payload: Value) -> CoreResult<bool> {
        if team_id.is_empty() {
            tracing::debug!("dropping job update without a team");
            return Ok(false);
        }
        let envelope = UpdateEnvelope {
            team_id: team_id.to_string(),
            payload,
        };
        let raw = serde_json::to_string(&envelope)?;
        self.store.publish(JOB_UPDATES_CHANNEL, &raw).await?;
        Ok(true)
    }
}
