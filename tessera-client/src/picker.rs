//! Combination picker.
//!
//! Given the permutation of responsible replicas for every action in a
//! transaction and the set of currently unreachable replicas, picks the
//! active set (the replicas that will execute the transaction and propose
//! ballots) and the passive set (the remaining involved replicas, which
//! only observe the outcome).
//!
//! An active replica must be able to vote on every object in the
//! transaction, so the candidates are the replicas appearing in every
//! permutation. Disabled replicas are never chosen as actives: an active
//! without a connection could neither receive the submission nor report a
//! boot count.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tessera_core::ReplicaId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoActiveQuorum {
    pub needed: usize,
    pub available: usize,
}

impl fmt::Display for NoActiveQuorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unable to assemble active quorum: need {}, have {}",
            self.needed, self.available
        )
    }
}

impl std::error::Error for NoActiveQuorum {}

pub struct CombinationPicker {
    f_inc: usize,
    disabled: BTreeSet<ReplicaId>,
    permutations: usize,
    /// Involved replicas in first-appearance order.
    involved: Vec<ReplicaId>,
    /// How many permutations each involved replica appears in.
    membership: HashMap<ReplicaId, usize>,
}

impl CombinationPicker {
    #[must_use]
    pub fn new(f_inc: usize, disabled: BTreeSet<ReplicaId>) -> Self {
        Self {
            f_inc,
            disabled,
            permutations: 0,
            involved: Vec::new(),
            membership: HashMap::new(),
        }
    }

    /// Add one action's responsible replicas (the top `two_f_inc` of its
    /// permutation).
    pub fn add_permutation(&mut self, replicas: &[ReplicaId]) {
        self.permutations += 1;
        for &replica in replicas {
            match self.membership.get_mut(&replica) {
                Some(count) => *count += 1,
                None => {
                    self.involved.push(replica);
                    self.membership.insert(replica, 1);
                }
            }
        }
    }

    /// Choose `(active, passive)` replica sets. The sets are disjoint and
    /// their union is exactly the involved replicas.
    ///
    /// # Errors
    ///
    /// Returns [`NoActiveQuorum`] when fewer than `f_inc` reachable
    /// replicas are common to every permutation.
    pub fn choose(self) -> Result<(Vec<ReplicaId>, Vec<ReplicaId>), NoActiveQuorum> {
        let candidates: Vec<ReplicaId> = self
            .involved
            .iter()
            .copied()
            .filter(|r| self.membership[r] == self.permutations && !self.disabled.contains(r))
            .collect();
        if self.permutations == 0 || candidates.len() < self.f_inc {
            return Err(NoActiveQuorum {
                needed: self.f_inc,
                available: candidates.len(),
            });
        }
        let active: Vec<ReplicaId> = candidates.into_iter().take(self.f_inc).collect();
        let passive: Vec<ReplicaId> = self
            .involved
            .iter()
            .copied()
            .filter(|r| !active.contains(r))
            .collect();
        Ok((active, passive))
    }
}
