//! Binary envelope for messages on the pub/sub channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬────────────┬──────────┐
//! │ kind     │ sync_step │ sender   │ session_id │ payload  │
//! │ 1 byte   │ 0-1 byte  │ 16 bytes │ variable   │ variable │
//! └──────────┴───────────┴──────────┴────────────┴──────────┘
//! ```
//!
//! `DocUpdate` payloads are Yrs updates, except when `sync_step` is
//! `Step1` or `Step1Reply`: then the payload is the sender's state vector.
//! A `Step1` is answered with a `Step2` diff followed by a `Step1Reply`;
//! a `Step1Reply` is answered with a `Step2` only, so exchanges terminate.
//! `AwarenessUpdate` payloads are encoded awareness entries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::CursorColor;

/// Message kinds routed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Document update or handshake
    DocUpdate = 1,
    /// Changed awareness entries
    AwarenessUpdate = 2,
}

impl MessageKind {
    /// Topic name used on the pub/sub channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::DocUpdate => "doc-update",
            MessageKind::AwarenessUpdate => "awareness-update",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake step marker on `DocUpdate` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncStep {
    /// Payload is a state vector; receivers answer with a diff.
    Step1 = 1,
    /// Payload is a diff answering a `Step1` or `Step1Reply`.
    Step2 = 2,
    /// Payload is the responder's state vector, sent back after answering
    /// a `Step1`. Receivers answer with a diff and nothing else.
    Step1Reply = 3,
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// Stable color derived from `peer_id`
    pub color: CursorColor,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: CursorColor::from_uuid(peer_id),
        }
    }
}

/// Top-level message exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    pub sync_step: Option<SyncStep>,
    pub sender: Uuid,
    pub session_id: String,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Handshake request carrying the sender's state vector.
    pub fn sync_step1(sender: Uuid, session_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::DocUpdate,
            sync_step: Some(SyncStep::Step1),
            sender,
            session_id: session_id.into(),
            payload: state_vector,
        }
    }

    /// Responder's state vector, sent after its `Step2` so the requester
    /// can return what the responder lacks.
    pub fn sync_step1_reply(
        sender: Uuid,
        session_id: impl Into<String>,
        state_vector: Vec<u8>,
    ) -> Self {
        Self {
            kind: MessageKind::DocUpdate,
            sync_step: Some(SyncStep::Step1Reply),
            sender,
            session_id: session_id.into(),
            payload: state_vector,
        }
    }

    /// Handshake response carrying a diff.
    pub fn sync_step2(sender: Uuid, session_id: impl Into<String>, diff: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::DocUpdate,
            sync_step: Some(SyncStep::Step2),
            sender,
            session_id: session_id.into(),
            payload: diff,
        }
    }

    /// Incremental document update.
    pub fn update(sender: Uuid, session_id: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::DocUpdate,
            sync_step: None,
            sender,
            session_id: session_id.into(),
            payload: update,
        }
    }

    /// Awareness delta.
    pub fn awareness(sender: Uuid, session_id: impl Into<String>, entries: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::AwarenessUpdate,
            sync_step: None,
            sender,
            session_id: session_id.into(),
            payload: entries,
        }
    }

    /// True for a handshake request.
    pub fn is_handshake_request(&self) -> bool {
        self.kind == MessageKind::DocUpdate && self.sync_step == Some(SyncStep::Step1)
    }

    /// True when the payload is a state vector to be answered with a diff.
    pub fn carries_state_vector(&self) -> bool {
        self.kind == MessageKind::DocUpdate
            && matches!(self.sync_step, Some(SyncStep::Step1 | SyncStep::Step1Reply))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}
