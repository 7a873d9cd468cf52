//! Transaction outcomes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{TxnId, VarId};

/// Rerun payload for an aborted transaction: the state a proposer observed
/// that invalidated one of the transaction's reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub var: VarId,
    pub version: TxnId,
    pub value: Bytes,
}

/// Abort sub-variants.
///
/// `Rerun` carries the updates a client needs to retry against fresh state;
/// `Resubmit` omits them (proposers do not need the payloads, so the
/// submitter-directed copy of an abort is always rewritten to `Resubmit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Abort {
    Resubmit,
    Rerun(Vec<Update>),
}

/// The decided outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Commit,
    Abort(Abort),
}

impl Outcome {
    #[must_use]
    pub fn is_commit(&self) -> bool {
        matches!(self, Outcome::Commit)
    }

    /// The submitter-directed form of this outcome: aborts drop their
    /// update payloads.
    #[must_use]
    pub fn for_submitter(&self) -> Outcome {
        match self {
            Outcome::Commit => Outcome::Commit,
            Outcome::Abort(_) => Outcome::Abort(Abort::Resubmit),
        }
    }
}
