//! Replicated node-status document.
//!
//! The merge algorithm is not implemented here; it is supplied by a
//! [`Replica`] implementation:
//!
//! ```text
//! ┌──────────────┐  save / merge_snapshot   ┌──────────────┐
//! │ Replica      │ ◄──────────────────────► │ Replica      │
//! │ (authority)  │  set_status → delta      │ (client)     │
//! └──────────────┘  apply_delta             └──────────────┘
//! ```
//!
//! - [`YrsReplica`]: Production replica backed by a yrs document.
//! - [`LwwReplica`]: Last-writer-wins map, small enough to reason about
//!   in tests.

pub mod lww;
pub mod yrs_doc;
mod yrs_guard;

pub use lww::LwwReplica;
pub use yrs_doc::YrsReplica;

use serde::{Deserialize, Serialize};

/// Node ids the authoritative document is created with.
pub const INITIAL_NODES: [&str; 4] = ["Junction1", "Junction2", "Junction3", "Junction4"];

/// Open/closed state of a junction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Open,
    Closed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Open => "open",
            NodeStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(NodeStatus::Open),
            "closed" => Some(NodeStatus::Closed),
            _ => None,
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            NodeStatus::Open => NodeStatus::Closed,
            NodeStatus::Closed => NodeStatus::Open,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A materialised node record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub status: NodeStatus,
}

/// Replica errors. The document is left untouched when one is returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplicaError {
    #[error("Invalid replica bytes: {0}")]
    Decode(String),
    #[error("Update could not be integrated: {0}")]
    Merge(String),
    #[error("Replica encode failed: {0}")]
    Encode(String),
}

/// A mergeable copy of the node-status document.
///
/// Implementations must make merging commutative, associative and
/// idempotent: applying the same delta or snapshot twice leaves the state
/// as if it had been applied once.
pub trait Replica: Send + 'static {
    /// A replica with no nodes, ready to merge a snapshot into.
    fn empty() -> Self
    where
        Self: Sized;

    /// A fresh replica containing `ids`, all open.
    fn seeded(ids: &[&str]) -> Self
    where
        Self: Sized;

    /// The authoritative starting document.
    fn initial() -> Self
    where
        Self: Sized,
    {
        Self::seeded(&INITIAL_NODES)
    }

    /// Serialize the full state.
    fn save(&self) -> Result<Vec<u8>, ReplicaError>;

    /// Merge a snapshot produced by [`Replica::save`] on any replica.
    fn merge_snapshot(&mut self, snapshot: &[u8]) -> Result<(), ReplicaError>;

    /// Merge a delta produced by [`Replica::set_status`] on any replica.
    fn apply_delta(&mut self, delta: &[u8]) -> Result<(), ReplicaError>;

    /// Set a node's status and return the delta between the old and new
    /// state. Unknown node ids are ignored and yield `None`.
    fn set_status(
        &mut self,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<Option<Vec<u8>>, ReplicaError>;

    /// All nodes, ordered by id.
    fn nodes(&self) -> Vec<Node>;

    fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes()
            .into_iter()
            .find(|n| n.id == node_id)
            .map(|n| n.status)
    }

    /// Flip a node between open and closed.
    fn toggle(&mut self, node_id: &str) -> Result<Option<Vec<u8>>, ReplicaError> {
        match self.status(node_id) {
            Some(current) => self.set_status(node_id, current.toggled()),
            None => Ok(None),
        }
    }
}
