//! Client and server transaction records.
//!
//! Clients describe a transaction as a list of actions over objects. The
//! submitter translates that into the server record, which additionally
//! carries routing metadata: submitter identity, quorum parameters, and one
//! [`Allocation`] per involved replica.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{BootCount, Positions, ReplicaId, TxnId, VarId};

// ---------------------------------------------------------------------------
// Client records
// ---------------------------------------------------------------------------

/// A transaction as supplied by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTxn {
    pub id: TxnId,
    /// Retry transactions block server-side until a watched object changes;
    /// ballots for them are determined eagerly and shutdown broadcasts an
    /// abort resubmission for them.
    pub retry: bool,
    pub actions: Vec<ClientAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAction {
    pub var: VarId,
    pub kind: ClientActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientActionKind {
    Read {
        version: TxnId,
    },
    Write {
        value: Bytes,
        references: Vec<VarId>,
    },
    ReadWrite {
        version: TxnId,
        value: Bytes,
        references: Vec<VarId>,
    },
    Create {
        value: Bytes,
        references: Vec<VarId>,
    },
    Roll {
        version: TxnId,
        value: Bytes,
        references: Vec<VarId>,
    },
}

// ---------------------------------------------------------------------------
// Server records
// ---------------------------------------------------------------------------

/// A reference from one object to another, annotated with the target's
/// placement. Translation leaves `positions` empty for references to
/// objects created in the same transaction; they are back-patched before
/// the transaction is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRef {
    pub var: VarId,
    pub positions: Option<Positions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub var: VarId,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Read {
        version: TxnId,
    },
    Write {
        value: Bytes,
        references: Vec<VarRef>,
    },
    ReadWrite {
        version: TxnId,
        value: Bytes,
        references: Vec<VarRef>,
    },
    Create {
        value: Bytes,
        positions: Positions,
        references: Vec<VarRef>,
    },
    Roll {
        version: TxnId,
        value: Bytes,
        references: Vec<VarRef>,
    },
}

impl ActionKind {
    #[must_use]
    pub fn references(&self) -> &[VarRef] {
        match self {
            ActionKind::Read { .. } => &[],
            ActionKind::Write { references, .. }
            | ActionKind::ReadWrite { references, .. }
            | ActionKind::Create { references, .. }
            | ActionKind::Roll { references, .. } => references,
        }
    }

    pub fn references_mut(&mut self) -> &mut [VarRef] {
        match self {
            ActionKind::Read { .. } => &mut [],
            ActionKind::Write { references, .. }
            | ActionKind::ReadWrite { references, .. }
            | ActionKind::Create { references, .. }
            | ActionKind::Roll { references, .. } => references,
        }
    }
}

/// One involved replica's share of a transaction.
///
/// `action_indices` are the indices (ascending) of the actions this replica
/// is responsible for. `active` is zero for passive replicas; for active
/// replicas it is the submitter's last observed boot count of that replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub replica: ReplicaId,
    pub action_indices: Vec<u16>,
    pub active: BootCount,
}

impl Allocation {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active != BootCount(0)
    }
}

/// The server-side transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    pub id: TxnId,
    pub retry: bool,
    pub submitter: ReplicaId,
    pub submitter_boot_count: BootCount,
    pub f_inc: u16,
    pub topology_version: u32,
    pub actions: Vec<Action>,
    /// Actives first, then passives. The two sets are disjoint.
    pub allocations: Vec<Allocation>,
}

impl Txn {
    /// The acceptors of this transaction: every allocation replica, in
    /// allocation order.
    #[must_use]
    pub fn acceptors(&self) -> Vec<ReplicaId> {
        self.allocations.iter().map(|a| a.replica).collect()
    }
}
