//! Replication session state: the relation cache and LSN/feedback tracking.
//!
//! The cache and LSN counters are owned solely by the consumer's worker;
//! nothing else touches them, so plain `HashMap`/integers suffice.

use crate::model::{ColumnDescriptor, RelationDescriptor};
use crate::replication::protocol::{Oid, RawRelation};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug)]
pub struct ReplicationState {
    relations: HashMap<Oid, RelationDescriptor>,
    /// Highest LSN received from the server (set on every XLogData frame).
    pub received_lsn: u64,
    /// Highest LSN successfully handed off to the transform pipeline.
    pub applied_lsn: u64,
    pub last_feedback_time: Instant,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
            received_lsn: 0,
            applied_lsn: 0,
            last_feedback_time: Instant::now(),
        }
    }

    /// Overwrites the cache entry for `relation.oid`, per the `Relation`
    /// message's replace-wholesale semantics.
    pub fn upsert_relation(&mut self, relation: RawRelation) {
        let descriptor = RelationDescriptor {
            relation_id: relation.oid,
            namespace: relation.namespace,
            name: relation.name,
            replica_identity: relation.replica_identity,
            columns: relation
                .columns
                .into_iter()
                .map(|c| ColumnDescriptor { name: c.name, type_oid: c.type_oid, is_key: c.is_key })
                .collect(),
        };
        self.relations.insert(descriptor.relation_id, descriptor);
    }

    pub fn get_relation(&self, oid: Oid) -> Option<&RelationDescriptor> {
        self.relations.get(&oid)
    }

    pub fn update_received_lsn(&mut self, lsn: u64) {
        if lsn > self.received_lsn {
            self.received_lsn = lsn;
        }
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::RawColumnInfo;

    fn sample_relation() -> RawRelation {
        RawRelation {
            oid: 1,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: 'd',
            columns: vec![RawColumnInfo {
                is_key: true,
                name: "id".to_string(),
                type_oid: 23,
                atttypmod: -1,
            }],
        }
    }

    #[test]
    fn upsert_then_lookup() {
        let mut state = ReplicationState::new();
        state.upsert_relation(sample_relation());
        let rel = state.get_relation(1).unwrap();
        assert_eq!(rel.name, "users");
        assert_eq!(rel.key_columns(), vec!["id".to_string()]);
    }

    #[test]
    fn missing_relation_returns_none() {
        let state = ReplicationState::new();
        assert!(state.get_relation(99).is_none());
    }

    #[test]
    fn received_lsn_only_moves_forward() {
        let mut state = ReplicationState::new();
        state.update_received_lsn(100);
        state.update_received_lsn(50);
        assert_eq!(state.received_lsn, 100);
        state.update_received_lsn(150);
        assert_eq!(state.received_lsn, 150);
    }
}
