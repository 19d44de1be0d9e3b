//! # junction-collab: Shared junction graph with live presence
//!
//! Keeps a small graph of named junctions, each open or closed, in sync
//! between every connected client. A central relay holds the
//! authoritative replica and forwards deltas and cursor positions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   JSON text frames  │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ SyncAgent   │                     │ Hub         │
//! │ + Replica   │                     │ + Replica   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │SessionRegistry │
//!                                    │ (fan-out)      │
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames and the base64 payload codec
//! - [`replica`]: Mergeable document replicas (yrs and last-writer-wins)
//! - [`broadcast`]: Session registry with non-blocking fan-out
//! - [`server`]: WebSocket relay server
//! - [`agent`]: Client state machine, free of I/O
//! - [`client`]: WebSocket client driving an agent
//! - [`presence`]: Cursor throttling, smoothing and expiry

pub mod protocol;
pub mod replica;
pub mod broadcast;
pub mod server;
pub mod agent;
pub mod client;
pub mod presence;

// Re-exports for convenience
pub use protocol::{
    decode_payload, encode_payload, CursorPayload, MessageKind, ProtocolError, WireMessage,
};
pub use replica::{LwwReplica, Node, NodeStatus, Replica, ReplicaError, YrsReplica};
pub use broadcast::{BroadcastStats, FanOut, Frame, RemovedSession, SessionId, SessionRegistry};
pub use server::{Hub, ServerConfig, ServerStats, SyncServer};
pub use agent::{ConnectionState, RenderFrame, SyncAgent};
pub use client::{ClientConfig, SyncClient, SyncEvent};
pub use presence::{CursorBoard, CursorRenderData, CursorState, CursorThrottle};
