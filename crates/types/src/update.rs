// crates/types/src/update.rs
//! The single update shape pushed to clients, and the pub/sub envelope that
//! carries raw updates between processes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Store pub/sub channel carrying `UpdateEnvelope` JSON.
pub const JOB_UPDATES_CHANNEL: &str = "job_updates";

/// What travels on `job_updates`: the owning team plus a raw payload in
/// whatever shape the producer had at hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    pub team_id: String,
    pub payload: Value,
}

/// Normalized job update delivered to clients as `job_update`.
///
/// The stable fields are always serialized (as `null` when unknown).
/// `error`, `result` and `processingTimeMs` appear only when the source
/// carried a meaningful value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: Option<String>,
    pub status: Option<String>,
    pub progress: f64,
    pub chunk_index: Option<u64>,
    pub total_chunks: Option<u64>,
    pub name: Option<String>,
    pub message: Option<String>,
    pub entity_id: Option<String>,
    pub session_id: Option<String>,
    pub session_start_time: Option<String>,
    pub timestamp: String,
    pub queue_type: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
}

impl JobUpdate {
    /// Reshape an arbitrary payload into the canonical update.
    ///
    /// `entity_field` names the payload field holding the owning entity id
    /// (e.g. `trajectoryId`); a literal `entityId` is used as a fallback.
    pub fn normalize(payload: &Value, entity_field: &str) -> Self {
        let text = |field: &str| payload.get(field).and_then(as_text);
        let present = |field: &str| payload.get(field).filter(|v| truthy(v)).cloned();

        Self {
            job_id: text("jobId"),
            status: text("status"),
            progress: payload
                .get("progress")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            chunk_index: payload.get("chunkIndex").and_then(Value::as_u64),
            total_chunks: payload.get("totalChunks").and_then(Value::as_u64),
            name: text("name"),
            message: text("message"),
            entity_id: text(entity_field).or_else(|| text("entityId")),
            session_id: text("sessionId"),
            session_start_time: text("sessionStartTime"),
            timestamp: text("timestamp")
                .filter(|t| !t.is_empty())
                .unwrap_or_else(crate::now_rfc3339),
            queue_type: text("queueType")
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            kind: text("type"),
            error: present("error"),
            result: present("result"),
            processing_time_ms: present("processingTimeMs").and_then(|v| v.as_f64()),
        }
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_fills_defaults() {
        let update = JobUpdate::normalize(&json!({ "jobId": "j1", "status": "running" }), "trajectoryId");

        assert_eq!(update.job_id.as_deref(), Some("j1"));
        assert_eq!(update.progress, 0.0);
        assert_eq!(update.queue_type, "unknown");
        assert!(!update.timestamp.is_empty());

        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("result").is_none());
        assert!(json.get("processingTimeMs").is_none());
        // stable fields are present even when unknown
        assert!(json.get("sessionId").unwrap().is_null());
        assert!(json.get("type").unwrap().is_null());
    }

    #[test]
    fn test_normalize_keeps_optional_fields_when_present() {
        let payload = json!({
            "jobId": 42,
            "status": "failed",
            "progress": 75,
            "trajectoryId": "traj-1",
            "queueType": "analysis",
            "timestamp": "2026-02-05T12:00:00.000Z",
            "error": "worker crashed",
            "processingTimeMs": 1200,
            "result": null,
            "unrelated": true
        });
        let update = JobUpdate::normalize(&payload, "trajectoryId");

        assert_eq!(update.job_id.as_deref(), Some("42"));
        assert_eq!(update.entity_id.as_deref(), Some("traj-1"));
        assert_eq!(update.error, Some(json!("worker crashed")));
        assert_eq!(update.processing_time_ms, Some(1200.0));
        assert_eq!(update.result, None);
        assert_eq!(update.timestamp, "2026-02-05T12:00:00.000Z");

        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("unrelated").is_none());
        assert_eq!(json["queueType"], "analysis");
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = UpdateEnvelope {
            team_id: "t1".into(),
            payload: json!({ "jobId": "j1" }),
        };
        let s = serde_json::to_string(&env).unwrap();
        assert_eq!(s, r#"{"teamId":"t1","payload":{"jobId":"j1"}}"#);
    }
}
