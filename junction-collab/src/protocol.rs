//! Text wire protocol for document deltas and cursor presence.
//!
//! Every frame is one UTF-8 JSON object. Binary CRDT payloads never travel
//! raw; they are base64-wrapped by the delta codec first.
//!
//! ```text
//! { "document": "<base64>" }                          server → client, once
//! { "userId": "U1", "changes": "<base64>" }           both directions
//! { "userId": "U1" }                                  client → server (login)
//! { "userId": "U1", "cursor": {"profile":2,"x":10,"y":20} }   both directions
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::replica::ReplicaError;

/// Number of distinct cursor profiles a client may pick from.
pub const PROFILE_COUNT: u8 = 5;

/// Encode opaque snapshot/delta bytes into a text-safe payload.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a text payload back into the opaque bytes it wraps.
pub fn decode_payload(text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text)
        .map_err(|e| ProtocolError::Codec(e.to_string()))
}

/// Which part of the protocol a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Full replica snapshot
    Document,
    /// Replica delta
    Changes,
    /// Presence update
    Cursor,
    /// Bare identifier announcement
    Login,
}

/// Pointer position plus the profile used to draw it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub profile: u8,
    pub x: f64,
    pub y: f64,
}

/// One protocol frame.
///
/// All fields are optional on the wire; in practice each frame carries
/// exactly one populated shape (see [`WireMessage::kind`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPayload>,
}

impl WireMessage {
    /// Login announcement.
    pub fn login(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Full snapshot sent to a freshly connected session.
    pub fn document(snapshot: &[u8]) -> Self {
        Self {
            document: Some(encode_payload(snapshot)),
            ..Self::default()
        }
    }

    /// Delta produced by a local edit.
    pub fn changes(user_id: impl Into<String>, delta: &[u8]) -> Self {
        Self {
            user_id: Some(user_id.into()),
            changes: Some(encode_payload(delta)),
            ..Self::default()
        }
    }

    /// Cursor presence update.
    pub fn cursor(user_id: impl Into<String>, profile: u8, x: f64, y: f64) -> Self {
        Self {
            user_id: Some(user_id.into()),
            cursor: Some(CursorPayload { profile, x, y }),
            ..Self::default()
        }
    }

    /// Parse a text frame.
    ///
    /// A frame that is valid JSON but carries none of the known fields is
    /// rejected the same way as malformed JSON.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: WireMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        if msg.kind().is_none() {
            return Err(ProtocolError::MissingField);
        }
        Ok(msg)
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// The primary shape of this frame, `None` if nothing recognised is set.
    pub fn kind(&self) -> Option<MessageKind> {
        if self.document.is_some() {
            Some(MessageKind::Document)
        } else if self.changes.is_some() {
            Some(MessageKind::Changes)
        } else if self.cursor.is_some() {
            Some(MessageKind::Cursor)
        } else if self.user_id.is_some() {
            Some(MessageKind::Login)
        } else {
            None
        }
    }

    /// Decoded snapshot bytes, if this frame carries one.
    pub fn document_bytes(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.document.as_deref().map(decode_payload).transpose()
    }

    /// Decoded delta bytes, if this frame carries one.
    pub fn changes_bytes(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.changes.as_deref().map(decode_payload).transpose()
    }
}

/// Protocol errors.
///
/// Only `Transport` and `ConnectionClosed` end a session; everything else
/// is reported and the connection stays open.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Parse(String),
    #[error("Frame carries no recognised field")]
    MissingField,
    #[error("Payload codec error: {0}")]
    Codec(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Merge failed: {0}")]
    Merge(#[from] ReplicaError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

impl ProtocolError {
    /// Whether this error should end the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectionClosed)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
