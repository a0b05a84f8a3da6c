//! Control and stream message schemas with JSON encoding.
//!
//! Every message is a self-describing record carrying a `type` tag. Control
//! messages ride the datagram bus; stream messages ride the length-framed
//! TCP transport between a leader and its followers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{Epoch, NodeId, PayloadId, Seq};

/// Datagram control plane: discovery, liveness and election.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    WhoIsLeader {
        sender_id: NodeId,
        sender_stream_port: u16,
    },
    IAmLeader {
        leader_id: NodeId,
        /// Advertised address, informational; receivers bind to the datagram
        /// source address instead, which survives multi-homed hosts.
        leader_ip: String,
        leader_stream_port: u16,
        epoch: Epoch,
        last_seq: u64,
    },
    LeaderAlive {
        leader_id: NodeId,
        epoch: Epoch,
        last_seq: u64,
    },
    Election {
        candidate_id: NodeId,
        epoch: Epoch,
    },
    Answer {
        responder_id: NodeId,
        epoch: Epoch,
    },
    Coordinator {
        leader_id: NodeId,
        leader_ip: String,
        leader_stream_port: u16,
        epoch: Epoch,
        last_seq: u64,
    },
}

/// A payload after sequencing. Never mutated once assigned `(epoch, seq)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub epoch: Epoch,
    pub seq: Seq,
    pub payload_id: PayloadId,
    pub submitter_id: NodeId,
    /// Submission wall time in ms, informational only.
    pub submitted_at_ms: u64,
    pub body: String,
}

/// Stream data plane between a follower and the leader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMessage {
    NewOrder {
        payload_id: PayloadId,
        submitter_id: NodeId,
        submitted_at_ms: u64,
        body: String,
    },
    Order(OrderRecord),
    ResendRequest {
        from_seq: Seq,
    },
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed record: {0}")]
    Malformed(#[source] serde_json::Error),
}

pub fn encode_control(message: &ControlMessage) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(message).map_err(ProtoError::Encode)
}

pub fn decode_control(bytes: &[u8]) -> Result<ControlMessage, ProtoError> {
    serde_json::from_slice(bytes).map_err(ProtoError::Malformed)
}

pub fn encode_stream(message: &StreamMessage) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(message).map_err(ProtoError::Encode)
}

pub fn decode_stream(bytes: &[u8]) -> Result<StreamMessage, ProtoError> {
    serde_json::from_slice(bytes).map_err(ProtoError::Malformed)
}
