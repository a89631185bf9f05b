// crates/relay/src/fanout.rs
//! Team subscriptions, snapshots and update delivery.
//!
//! A socket that subscribes to a team joins the team's room as
//! Initializing. While its snapshot is fetched, updates for the team are
//! buffered for it; after the snapshot is sent the buffer is flushed in
//! small paced batches and the socket becomes Ready, from then on getting
//! updates directly.
//!
//! Delivery only reaches sockets attached to this process. Other relay
//! instances receive the same pub/sub message and serve their own sockets.

use std::time::Instant;

use jobpulse_core::CoreResult;
use jobpulse_types::{JobUpdate, UpdateEnvelope};
use serde_json::Value;

use crate::metrics;
use crate::protocol::{ServerMessage, SubscribeRequest};
use crate::state::{ConnId, RelayState};

impl RelayState {
    /// Handle `subscribe_to_team`: switch rooms, send the snapshot, flush
    /// what arrived meanwhile.
    pub async fn subscribe(&self, conn: ConnId, request: SubscribeRequest) {
        let Some(team_id) = self.begin_subscription(conn, &request) else {
            return;
        };
        if self.deliver_snapshot(conn, &team_id).await {
            self.flush_pending(conn, &team_id).await;
        }
    }

    /// Move the socket into the requested team's room as Initializing.
    /// Returns the team, or `None` if the request named none.
    pub fn begin_subscription(&self, conn: ConnId, request: &SubscribeRequest) -> Option<String> {
        let team_id = request.team_id.as_deref().filter(|t| !t.is_empty());
        let previous = request.previous_team_id.as_deref().filter(|t| !t.is_empty());

        self.rooms().begin_init(conn, team_id, previous);

        if let Some(previous) = previous {
            tracing::debug!(conn_id = conn, team_id = previous, "left team room");
        }
        let team_id = team_id?;
        tracing::info!(conn_id = conn, team_id, "starting team init");
        Some(team_id.to_string())
    }

    /// Fetch and send the team snapshot. Returns false if the socket moved
    /// on (re-subscribed or disconnected) while the fetch was running.
    pub async fn deliver_snapshot(&self, conn: ConnId, team_id: &str) -> bool {
        let started = Instant::now();
        let jobs = match self
            .scanner
            .team_snapshot(team_id, &self.config.queues)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(conn_id = conn, team_id, error = %e, "team snapshot failed; sending empty list");
                Vec::new()
            }
        };
        let elapsed = started.elapsed();
        metrics::record_snapshot(elapsed);

        let frame = match ServerMessage::TeamJobs(&jobs).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(conn_id = conn, team_id, error = %e, "failed to encode snapshot; dropping init");
                self.rooms().abandon_init(conn, team_id);
                return false;
            }
        };

        let rooms = self.rooms();
        if !rooms.is_initializing(conn, team_id) {
            tracing::debug!(conn_id = conn, team_id, "socket moved on before snapshot arrived");
            return false;
        }
        self.send_to(conn, frame);
        drop(rooms);

        tracing::info!(
            conn_id = conn,
            team_id,
            jobs = jobs.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "team snapshot sent"
        );
        true
    }

    /// Send buffered updates in batches, pausing between batches, then mark
    /// the socket Ready. The final emptiness check and the Ready transition
    /// happen under the registry lock, so nothing buffered is left behind.
    pub async fn flush_pending(&self, conn: ConnId, team_id: &str) {
        let batch_size = self.config.flush_batch;
        let pacing = self.config.flush_pacing();
        let mut flushed = 0usize;

        loop {
            let batch = {
                let mut rooms = self.rooms();
                let Some(batch) = rooms.next_flush_batch(conn, team_id, batch_size) else {
                    break;
                };
                for frame in &batch {
                    self.send_to(conn, frame.clone());
                }
                batch.len()
            };
            flushed += batch;
            tokio::time::sleep(pacing).await;
        }

        tracing::info!(conn_id = conn, team_id, flushed, "socket ready");
    }

    /// Route one update for `team_id` to this process's sockets.
    pub fn handle_job_update(&self, team_id: &str, payload: &Value) {
        let update = JobUpdate::normalize(payload, &self.config.entity_field);
        let frame = match ServerMessage::JobUpdate(&update).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(team_id, error = %e, "failed to encode job update");
                return;
            }
        };

        let mut rooms = self.rooms();
        let routing = rooms.route(
            team_id,
            &frame,
            self.config.max_pending,
            self.config.keep_pending,
        );
        for conn in &routing.deliver_to {
            self.send_to(*conn, frame.clone());
        }
        drop(rooms);

        if routing.dropped > 0 {
            tracing::warn!(
                team_id,
                dropped = routing.dropped,
                kept = self.config.keep_pending,
                "pending update buffer overflowed; oldest updates dropped"
            );
        }
        tracing::debug!(
            team_id,
            job_id = update.job_id.as_deref().unwrap_or_default(),
            delivered = routing.deliver_to.len(),
            buffered = routing.buffered,
            "job update routed"
        );
        metrics::record_routing(routing.deliver_to.len(), routing.buffered, routing.dropped);
    }

    /// Decode a raw `job_updates` message and route it. Invalid messages are
    /// logged and dropped.
    pub fn handle_raw_update(&self, raw: &str) {
        match serde_json::from_str::<UpdateEnvelope>(raw) {
            Ok(envelope) if !envelope.team_id.is_empty() => {
                self.handle_job_update(&envelope.team_id, &envelope.payload)
            }
            Ok(_) => tracing::debug!("ignoring job update without a team"),
            Err(e) => {
                metrics::record_invalid_message();
                tracing::warn!(error = %e, "invalid pub/sub message");
            }
        }
    }

    /// Publish an update for a team. Delivery happens wherever the update is
    /// received, this process included; sockets are never touched here.
    pub async fn emit_job_update(&self, team_id: &str, payload: Value) -> CoreResult<bool> {
        if payload.is_null() {
            return Ok(false);
        }
        self.publisher.publish(team_id, payload).await
    }
}
