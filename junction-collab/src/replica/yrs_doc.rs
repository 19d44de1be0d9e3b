//! yrs-backed replica.
//!
//! The document holds a single root map, `nodes`, keyed by node id with the
//! status string as value. Snapshots and deltas are both yrs v1 updates;
//! a delta is the diff between the state vector before and after an edit.

use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact, Update, WriteTxn};

use super::{yrs_guard, Node, NodeStatus, Replica, ReplicaError};

const NODES_ROOT: &str = "nodes";

/// Production replica.
pub struct YrsReplica {
    doc: Doc,
}

impl YrsReplica {
    fn integrate(&mut self, bytes: &[u8]) -> Result<(), ReplicaError> {
        yrs_guard::check_update(bytes, NODES_ROOT)?;
        let update =
            Update::decode_v1(bytes).map_err(|e| ReplicaError::Decode(format!("{e:?}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Merge(format!("{e:?}")))
    }

    /// Underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::empty()
    }
}

impl Replica for YrsReplica {
    fn empty() -> Self {
        Self { doc: Doc::new() }
    }

    fn seeded(ids: &[&str]) -> Self {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let nodes = txn.get_or_insert_map(NODES_ROOT);
            for id in ids {
                nodes.insert(&mut txn, *id, NodeStatus::Open.as_str());
            }
        }
        Self { doc }
    }

    fn save(&self) -> Result<Vec<u8>, ReplicaError> {
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
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
        let before = {
            let txn = self.doc.transact();
            let known = txn
                .get_map(NODES_ROOT)
                .map_or(false, |nodes| nodes.get(&txn, node_id).is_some());
            if !known {
                return Ok(None);
            }
            txn.state_vector()
        };

        {
            let mut txn = self.doc.transact_mut();
            let nodes = txn.get_or_insert_map(NODES_ROOT);
            nodes.insert(&mut txn, node_id, status.as_str());
        }

        let txn = self.doc.transact();
        Ok(Some(txn.encode_diff_v1(&before)))
    }

    fn nodes(&self) -> Vec<Node> {
        let txn = self.doc.transact();
        let Some(nodes) = txn.get_map(NODES_ROOT) else {
            return Vec::new();
        };
        let mut out: Vec<Node> = nodes
            .iter(&txn)
            .filter_map(|(id, value)| {
                let status = NodeStatus::parse(&value.to_string(&txn))?;
                Some(Node {
                    id: id.to_string(),
                    status,
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn status(&self, node_id: &str) -> Option<NodeStatus> {
        let txn = self.doc.transact();
        let value = txn.get_map(NODES_ROOT)?.get(&txn, node_id)?;
        NodeStatus::parse(&value.to_string(&txn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::tests::{check_convergence, check_replica_contract, random_payloads};

    #[test]
    fn test_yrs_contract() {
        check_replica_contract::<YrsReplica>();
    }

    #[test]
    fn test_yrs_convergence() {
        check_convergence::<YrsReplica>();
    }

    #[test]
    fn test_yrs_empty_has_no_nodes() {
        let replica = YrsReplica::empty();
        assert!(replica.nodes().is_empty());
        assert_eq!(replica.status("Junction1"), None);
    }

    #[test]
    fn test_yrs_toggle_unknown_on_empty() {
        let mut replica = YrsReplica::empty();
        assert_eq!(replica.toggle("Junction1").unwrap(), None);
    }

    #[test]
    fn test_yrs_delta_smaller_than_snapshot() {
        let server = YrsReplica::initial();
        let mut client = YrsReplica::empty();
        client.merge_snapshot(&server.save().unwrap()).unwrap();

        let delta = client
            .set_status("Junction4", NodeStatus::Closed)
            .unwrap()
            .unwrap();
        assert!(!delta.is_empty());
        assert!(delta.len() < client.save().unwrap().len());
    }

    #[test]
    fn test_yrs_random_bytes_rejected_without_crash() {
        let mut replica = YrsReplica::initial();
        let before = replica.nodes();

        let mut payloads = random_payloads(5000, 0x5EED);
        payloads.push(vec![208, 255, 119, 128, 62, 199, 87, 240]);
        payloads.push(vec![0xFF; 64]);

        let mut accepted = 0;
        for payload in &payloads {
            if replica.apply_delta(payload).is_ok() {
                accepted += 1;
            }
            let _ = replica.merge_snapshot(payload);
        }
        assert!(accepted < payloads.len());
        assert_eq!(replica.nodes(), before);
        assert!(replica.save().is_ok());
    }

    #[test]
    fn test_yrs_snapshot_roundtrip() {
        let mut a = YrsReplica::initial();
        a.set_status("Junction3", NodeStatus::Closed).unwrap();

        let mut b = YrsReplica::empty();
        b.merge_snapshot(&a.save().unwrap()).unwrap();
        assert_eq!(a.nodes(), b.nodes());
    }
}
