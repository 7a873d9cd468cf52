//! Identifier newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica (resource manager) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u32);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RM{}", self.0)
    }
}

/// Monotonic restart counter of a replica.
///
/// In an [`Allocation`](crate::txn::Allocation), a boot count of zero marks
/// the replica as passive; active replicas carry the submitter's last
/// observed boot count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BootCount(pub u32);

/// Globally unique transaction identifier (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub [u8; 16]);

impl TxnId {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Stable shard key for dispatching work on this transaction.
    #[must_use]
    pub fn shard_key(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().expect("8-byte prefix"))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", bs58::encode(&self.0[..8]).into_string())
    }
}

/// Object (variable) identifier (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub [u8; 16]);

impl VarId {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var:{}", bs58::encode(&self.0[..8]).into_string())
    }
}

/// Placement permutation digits for an object.
///
/// Digit `i` selects one replica out of those not yet chosen
/// (`index = digit mod remaining`), so a `Positions` value deterministically
/// reconstructs the same permutation of the topology's replica list. The
/// digit string is at most `max_replica_count` long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Positions(pub Vec<u8>);

impl Positions {
    #[must_use]
    pub fn digits(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
