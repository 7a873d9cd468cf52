//! Immutable topology snapshots.

use serde::{Deserialize, Serialize};

use crate::ids::{Positions, ReplicaId, VarId};

/// The root object reference carried by a configured topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootVar {
    pub var: VarId,
    pub positions: Positions,
}

/// An immutable snapshot of the cluster configuration.
///
/// `f_inc` is f+1 (the commit quorum size) and `two_f_inc` is 2f+1 (the
/// number of replicas responsible for each object). The blank topology is
/// the "not yet configured" sentinel: submissions arriving while the
/// topology is blank are buffered by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub all_replicas: Vec<ReplicaId>,
    pub f_inc: u16,
    pub two_f_inc: u16,
    pub max_replica_count: u16,
    pub version: u32,
    pub root: Option<RootVar>,
}

impl Topology {
    #[must_use]
    pub fn blank() -> Self {
        Self {
            all_replicas: Vec::new(),
            f_inc: 0,
            two_f_inc: 0,
            max_replica_count: 0,
            version: 0,
            root: None,
        }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.version == 0 && self.all_replicas.is_empty()
    }
}
