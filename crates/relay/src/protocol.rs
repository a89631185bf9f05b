// crates/relay/src/protocol.rs
//! Socket wire format: JSON text frames shaped `{"event": .., "data": ..}`.

use jobpulse_types::{JobRecord, JobUpdate};
use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeToTeam(SubscribeRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub previous_team_id: Option<String>,
}

/// Frames the relay sends.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    TeamJobs(&'a [JobRecord]),
    JobUpdate(&'a JobUpdate),
}

impl ServerMessage<'_> {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobpulse_types::JobStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"event":"subscribe_to_team","data":{"teamId":"t2","previousTeamId":"t1"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeToTeam(SubscribeRequest {
                team_id: Some("t2".into()),
                previous_team_id: Some("t1".into()),
            })
        );

        let bare: ClientMessage =
            serde_json::from_str(r#"{"event":"subscribe_to_team","data":{}}"#).unwrap();
        assert_eq!(bare, ClientMessage::SubscribeToTeam(SubscribeRequest::default()));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"ping","data":{}}"#).is_err());
    }

    #[test]
    fn test_encode_team_jobs() {
        let jobs = vec![JobRecord::new("j1", JobStatus::Queued)];
        let frame = ServerMessage::TeamJobs(&jobs).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["event"], "team_jobs");
        assert_eq!(value["data"][0]["jobId"], "j1");
        assert_eq!(value["data"][0]["status"], json!("queued"));
    }
}
