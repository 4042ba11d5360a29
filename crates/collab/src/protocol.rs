use serde::{Deserialize, Serialize};

use crate::awareness::AwarenessUpdate;
use crate::operations::Operation;
use crate::replica::StateVector;
use crate::{CollabError, Result};

/// Frames exchanged over the room socket, as JSON text. The relay is an
/// opaque fan-out: every frame reaches every other member of the room, so
/// each message carries everything a receiver needs to act on it.
///
/// Handshake: a joining peer announces its state vector (`sync_step1`);
/// peers answer with the operations it is missing plus their own vector
/// (`sync_step2`); the joiner replies with an `update` covering whatever
/// the responder lacked. Steady state is incremental `update` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    #[serde(rename = "sync_step1")]
    SyncStep1 { state_vector: StateVector },

    #[serde(rename = "sync_step2")]
    SyncStep2 {
        operations: Vec<Operation>,
        state_vector: StateVector,
    },

    #[serde(rename = "update")]
    Update { operations: Vec<Operation> },

    #[serde(rename = "awareness")]
    Awareness { updates: Vec<AwarenessUpdate> },

    #[serde(rename = "error")]
    Error { message: String },
}

impl SyncMessage {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(CollabError::from)
    }

    /// Decodes one frame. Anything that does not parse as a known message
    /// shape is a protocol mismatch; the caller logs it and resets the
    /// connection rather than guessing.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CollabError::ProtocolMismatch(e.to_string()))
    }
}
