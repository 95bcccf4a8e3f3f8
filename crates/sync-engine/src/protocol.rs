/// Message types exchanged between dashboards and the coordinator
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{
    Ack, EntityId, MutationRecord, Reject, Result, SubmitResponse, SyncCoordinator, SyncError,
    VectorClock,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    // Mutation flow
    Submit { record: MutationRecord },

    Ack { ack: Ack },

    Reject { reject: Reject },

    /// Pushed to subscribers after the coordinator resolves a record
    Resolved { record: MutationRecord },

    // Catch-up after reconnect
    SyncRequest { known: BTreeMap<EntityId, VectorClock> },

    SyncResponse {
        snapshots: Vec<MutationRecord>,
        server_clock: VectorClock,
    },

    // Heartbeat
    Ping,

    Pong,

    Error { message: String },
}

impl SyncMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Submit { .. } => "submit",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::Reject { .. } => "reject",
            SyncMessage::Resolved { .. } => "resolved",
            SyncMessage::SyncRequest { .. } => "sync_request",
            SyncMessage::SyncResponse { .. } => "sync_response",
            SyncMessage::Ping => "ping",
            SyncMessage::Pong => "pong",
            SyncMessage::Error { .. } => "error",
        }
    }
}

impl From<SubmitResponse> for SyncMessage {
    fn from(response: SubmitResponse) -> Self {
        match response {
            SubmitResponse::Ack(ack) => SyncMessage::Ack { ack },
            SubmitResponse::Reject(reject) => SyncMessage::Reject { reject },
        }
    }
}

impl SyncCoordinator {
    /// Answer one request message. Store failures become `Error` replies so
    /// the sender treats them as transient.
    pub async fn handle_message(&self, message: SyncMessage) -> SyncMessage {
        debug!(kind = message.kind(), "handling message");

        let reply: Result<SyncMessage> = match message {
            SyncMessage::Submit { record } => self.submit(record).await.map(SyncMessage::from),

            SyncMessage::SyncRequest { known } => {
                self.catch_up(&known)
                    .await
                    .map(|catch_up| SyncMessage::SyncResponse {
                        snapshots: catch_up.snapshots,
                        server_clock: catch_up.server_clock,
                    })
            }

            SyncMessage::Ping => Ok(SyncMessage::Pong),

            other => Err(SyncError::Protocol(format!(
                "unexpected {} message from a dashboard",
                other.kind()
            ))),
        };

        reply.unwrap_or_else(|err| SyncMessage::Error {
            message: err.to_string(),
        })
    }
}
