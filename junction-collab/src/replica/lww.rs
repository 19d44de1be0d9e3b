//! Last-writer-wins replica.
//!
//! Each node carries a Lamport stamp `(clock, writer)`; merge keeps the
//! entry with the greater stamp. Snapshots and deltas share one bincode
//! encoding: a sorted map of node id to stamped entry, so equal states
//! serialize to equal bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Node, NodeStatus, Replica, ReplicaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    status: NodeStatus,
    clock: u64,
    writer: Uuid,
}

impl Entry {
    fn stamp(&self) -> (u64, Uuid) {
        (self.clock, self.writer)
    }
}

/// Deterministic LWW map replica.
#[derive(Debug, Clone)]
pub struct LwwReplica {
    writer: Uuid,
    clock: u64,
    entries: BTreeMap<String, Entry>,
}

impl LwwReplica {
    /// Create an empty replica with a fixed writer id (for testing).
    pub fn with_writer(writer: Uuid) -> Self {
        Self {
            writer,
            clock: 0,
            entries: BTreeMap::new(),
        }
    }

    fn encode(entries: &BTreeMap<String, Entry>) -> Result<Vec<u8>, ReplicaError> {
        bincode::serde::encode_to_vec(entries, bincode::config::standard())
            .map_err(|e| ReplicaError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<BTreeMap<String, Entry>, ReplicaError> {
        let (entries, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ReplicaError::Decode(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(entries)
    }

    fn integrate(&mut self, bytes: &[u8]) -> Result<(), ReplicaError> {
        let incoming = Self::decode(bytes)?;
        for (id, entry) in incoming {
            self.clock = self.clock.max(entry.clock);
            match self.entries.get(&id) {
                Some(current) if current.stamp() >= entry.stamp() => {}
                _ => {
                    self.entries.insert(id, entry);
                }
            }
        }
        Ok(())
    }
}

impl Replica for LwwReplica {
    fn empty() -> Self {
        Self::with_writer(Uuid::new_v4())
    }

    fn seeded(ids: &[&str]) -> Self {
        let mut replica = Self::empty();
        for id in ids {
            replica.entries.insert(
                id.to_string(),
                Entry {
                    status: NodeStatus::Open,
                    clock: 0,
                    writer: Uuid::nil(),
                },
            );
        }
        replica
    }

    fn save(&self) -> Result<Vec<u8>, ReplicaError> {
        Self::encode(&self.entries)
    }

    fn merge_snapshot(&mut self, snapshot: &[u8]) -> Result<(), ReplicaError> {
        self.integrate(snapshot)
    }

    fn apply_delta(&mut self, delta: &[u8]) -> Result<(), ReplicaError> {
        self.integrate(delta)
    }

    fn set_status(
        &mut self,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<Option<Vec<u8>>, ReplicaError> {
        if !self.entries.contains_key(node_id) {
            return Ok(None);
        }
        self.clock += 1;
        let entry = Entry {
            status,
            clock: self.clock,
            writer: self.writer,
        };
        self.entries.insert(node_id.to_string(), entry);

        let mut delta = BTreeMap::new();
        delta.insert(node_id.to_string(), entry);
        Self::encode(&delta).map(Some)
    }

    fn nodes(&self) -> Vec<Node> {
        self.entries
            .iter()
            .map(|(id, entry)| Node {
                id: id.clone(),
                status: entry.status,
            })
            .collect()
    }

    fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.entries.get(node_id).map(|e| e.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::tests::{check_convergence, check_replica_contract};

    #[test]
    fn test_lww_contract() {
        check_replica_contract::<LwwReplica>();
    }

    #[test]
    fn test_lww_convergence_bytes_equal() {
        let (left, right) = check_convergence::<LwwReplica>();
        assert_eq!(left.save().unwrap(), right.save().unwrap());
    }

    #[test]
    fn test_lww_later_write_wins() {
        let base = LwwReplica::initial().save().unwrap();
        let mut a = LwwReplica::with_writer(Uuid::from_u128(1));
        let mut b = LwwReplica::with_writer(Uuid::from_u128(2));
        a.merge_snapshot(&base).unwrap();
        b.merge_snapshot(&base).unwrap();

        let first = a.set_status("Junction2", NodeStatus::Closed).unwrap().unwrap();
        b.apply_delta(&first).unwrap();
        // b has seen a's clock, so its write is stamped later.
        let second = b.set_status("Junction2", NodeStatus::Open).unwrap().unwrap();
        a.apply_delta(&second).unwrap();

        assert_eq!(a.status("Junction2"), Some(NodeStatus::Open));
        assert_eq!(b.status("Junction2"), Some(NodeStatus::Open));
    }

    #[test]
    fn test_lww_concurrent_tie_breaks_on_writer() {
        let base = LwwReplica::initial().save().unwrap();
        let mut a = LwwReplica::with_writer(Uuid::from_u128(1));
        let mut b = LwwReplica::with_writer(Uuid::from_u128(2));
        a.merge_snapshot(&base).unwrap();
        b.merge_snapshot(&base).unwrap();

        let da = a.set_status("Junction1", NodeStatus::Closed).unwrap().unwrap();
        let db = b.set_status("Junction1", NodeStatus::Open).unwrap().unwrap();
        a.apply_delta(&db).unwrap();
        b.apply_delta(&da).unwrap();

        assert_eq!(a.status("Junction1"), Some(NodeStatus::Open));
        assert_eq!(b.status("Junction1"), Some(NodeStatus::Open));
    }

    #[test]
    fn test_lww_malformed_delta_leaves_state() {
        let mut replica = LwwReplica::initial();
        let before = replica.nodes();
        let err = replica.apply_delta(&[0xFF, 0xFE, 0xFD]).unwrap_err();
        assert!(matches!(err, ReplicaError::Decode(_)));
        assert_eq!(replica.nodes(), before);
    }

    #[test]
    fn test_lww_snapshot_deterministic() {
        let a = LwwReplica::initial();
        let b = LwwReplica::initial();
        assert_eq!(a.save().unwrap(), b.save().unwrap());
    }
}
