//! Pure ballot accumulation - no I/O, no async.
//!
//! A transaction has one voting instance per (object, responsible replica)
//! pair. Each instance submits ballots; higher-round ballots supersede
//! earlier ones from the same instance, so an instance may change its mind.
//! Once enough instances have voted, the accumulator combines the votes into
//! a transaction outcome. The outcome itself may change as further ballots
//! arrive; the acceptor state machine handles that by re-entering its
//! write-to-disk state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use tessera_core::{Abort, Outcome, ReplicaId, Txn, TxnId, Update, VarId};

/// A single instance's vote on its object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    /// A read was made against a stale version; carries the fresher state.
    AbortBadRead(Vec<Update>),
    AbortDeadlock,
}

impl Vote {
    #[must_use]
    pub fn is_commit(&self) -> bool {
        matches!(self, Vote::Commit)
    }
}

/// A ballot as accepted by a Paxos instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    /// Paxos round within the instance; a later round replaces an earlier
    /// vote from the same instance.
    pub round: u32,
    pub vote: Vote,
}

/// Serialized form of one instance's accepted ballot, persisted as part of
/// the durable acceptor record and used to rebuild the accumulator on
/// restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub var: VarId,
    pub replica: ReplicaId,
    pub ballot: Ballot,
}

/// Accumulates ballots for one transaction until an outcome is determined.
#[derive(Debug)]
pub struct BallotAccumulator {
    txn_id: TxnId,
    f_inc: usize,
    retry: bool,
    /// Per object: the voting instances (from the allocations) and the
    /// highest-round ballot seen from each.
    instances: BTreeMap<VarId, BTreeMap<ReplicaId, Option<Ballot>>>,
}

impl BallotAccumulator {
    /// Build the accumulator from a server transaction: for each action, the
    /// voting instances are the allocation replicas whose action-index lists
    /// contain that action.
    #[must_use]
    pub fn new(txn_id: TxnId, txn: &Txn) -> Self {
        let mut instances: BTreeMap<VarId, BTreeMap<ReplicaId, Option<Ballot>>> = BTreeMap::new();
        for (idx, action) in txn.actions.iter().enumerate() {
            let voters = instances.entry(action.var).or_default();
            for alloc in &txn.allocations {
                let involved = alloc
                    .action_indices
                    .iter()
                    .any(|&i| usize::from(i) == idx);
                if involved {
                    voters.entry(alloc.replica).or_insert(None);
                }
            }
        }
        Self {
            txn_id,
            f_inc: usize::from(txn.f_inc),
            retry: txn.retry,
            instances,
        }
    }

    /// Rebuild an accumulator from persisted per-instance records.
    #[must_use]
    pub fn from_records(txn_id: TxnId, txn: &Txn, records: Vec<InstanceRecord>) -> Self {
        let mut acc = Self::new(txn_id, txn);
        for record in records {
            if let Some(slot) = acc
                .instances
                .get_mut(&record.var)
                .and_then(|voters| voters.get_mut(&record.replica))
            {
                *slot = Some(record.ballot);
            } else {
                warn!(txn = %txn_id, var = %record.var, replica = %record.replica,
                    "persisted ballot for unknown instance");
            }
        }
        acc
    }

    /// Record a ballot from `replica`'s instance for `var`.
    ///
    /// Returns the combined outcome if one is (still) determined after this
    /// ballot. The caller compares it against the outcome it already holds;
    /// only a changed outcome triggers a new durable write.
    pub fn ballot_received(
        &mut self,
        replica: ReplicaId,
        var: VarId,
        ballot: Ballot,
    ) -> Option<Outcome> {
        let Some(slot) = self
            .instances
            .get_mut(&var)
            .and_then(|voters| voters.get_mut(&replica))
        else {
            warn!(txn = %self.txn_id, %var, %replica, "ballot from unknown instance");
            return None;
        };
        match slot {
            Some(existing) if existing.round > ballot.round => {}
            _ => *slot = Some(ballot),
        }
        self.determine()
    }

    /// The per-instance records to persist alongside the outcome.
    #[must_use]
    pub fn records(&self) -> Vec<InstanceRecord> {
        self.instances
            .iter()
            .flat_map(|(var, voters)| {
                voters.iter().filter_map(|(replica, ballot)| {
                    ballot.as_ref().map(|b| InstanceRecord {
                        var: *var,
                        replica: *replica,
                        ballot: b.clone(),
                    })
                })
            })
            .collect()
    }

    /// Combine the recorded votes into an outcome, if determined.
    ///
    /// A normal transaction is determined once every object has votes from
    /// at least `f_inc` of its instances. A retry transaction is determined
    /// as soon as any vote at all is recorded: its proposers only ballot
    /// once a watched object has changed.
    fn determine(&self) -> Option<Outcome> {
        if self.instances.is_empty() {
            return None;
        }
        let determined = if self.retry {
            self.instances
                .values()
                .any(|voters| vote_count(voters) > 0)
        } else {
            self.instances
                .values()
                .all(|voters| vote_count(voters) >= self.f_inc)
        };
        if !determined {
            return None;
        }

        let mut updates = Vec::new();
        let mut all_commit = true;
        for ballot in self.instances.values().flat_map(BTreeMap::values).flatten() {
            match &ballot.vote {
                Vote::Commit => {}
                Vote::AbortDeadlock => all_commit = false,
                Vote::AbortBadRead(more) => {
                    all_commit = false;
                    for update in more {
                        if !updates.contains(update) {
                            updates.push(update.clone());
                        }
                    }
                }
            }
        }
        Some(if all_commit {
            Outcome::Commit
        } else if updates.is_empty() {
            Outcome::Abort(Abort::Resubmit)
        } else {
            Outcome::Abort(Abort::Rerun(updates))
        })
    }
}

fn vote_count(voters: &BTreeMap<ReplicaId, Option<Ballot>>) -> usize {
    voters.values().filter(|b| b.is_some()).count()
}
