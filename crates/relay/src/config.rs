// crates/relay/src/config.rs
//! Relay settings. Every flag can also be set through a `JOBPULSE_*`
//! environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Args, Parser};
use jobpulse_observability::LogFormat;

#[derive(Debug, Clone, Parser)]
#[command(name = "jobpulse-relay", about = "Realtime job update fanout over WebSockets")]
pub struct RelayConfig {
    #[arg(long, env = "JOBPULSE_BIND", default_value = "0.0.0.0:47893")]
    pub bind: SocketAddr,

    /// `redis://host:port` for a shared Redis, or `memory://` for a
    /// single-process in-memory store.
    #[arg(long, env = "JOBPULSE_STORE_URL", default_value = "memory://")]
    pub store_url: String,

    #[arg(long, env = "JOBPULSE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics at `/metrics`.
    #[arg(long, env = "JOBPULSE_METRICS", default_value_t = true, action = ArgAction::Set)]
    pub metrics: bool,

    #[command(flatten)]
    pub fanout: FanoutConfig,
}

/// How snapshots are built and how updates are buffered while one is in
/// flight.
#[derive(Debug, Clone, Args)]
pub struct FanoutConfig {
    /// Queues merged into a team snapshot.
    #[arg(long, env = "JOBPULSE_QUEUES", value_delimiter = ',', default_value = "analysis")]
    pub queues: Vec<String>,

    /// Payload field holding the owning entity id.
    #[arg(long, env = "JOBPULSE_ENTITY_FIELD", default_value = "entityId")]
    pub entity_field: String,

    /// Buffer length that triggers truncation.
    #[arg(long, env = "JOBPULSE_MAX_PENDING", default_value_t = 1000)]
    pub max_pending: usize,

    /// Newest frames kept when a buffer is truncated.
    #[arg(long, env = "JOBPULSE_KEEP_PENDING", default_value_t = 50)]
    pub keep_pending: usize,

    #[arg(long, env = "JOBPULSE_FLUSH_BATCH", default_value_t = 10)]
    pub flush_batch: usize,

    #[arg(long, env = "JOBPULSE_FLUSH_PACING_MS", default_value_t = 10)]
    pub flush_pacing_ms: u64,
}

impl FanoutConfig {
    pub fn flush_pacing(&self) -> Duration {
        Duration::from_millis(self.flush_pacing_ms)
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queues: vec!["analysis".to_string()],
            entity_field: "entityId".to_string(),
            max_pending: 1000,
            keep_pending: 50,
            flush_batch: 10,
            flush_pacing_ms: 10,
        }
    }
}
