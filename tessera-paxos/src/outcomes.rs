//! Submitter-side outcome accumulation.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{trace, warn};

use tessera_core::{Outcome, ReplicaId, TxnId};

/// Counts outcomes reported by a transaction's acceptors and detects when
/// `f_inc` of them agree.
///
/// Acceptors can change their mind while ballots are still arriving, so a
/// replica's newest report replaces its previous one. Redelivery of the same
/// outcome by the same replica is a no-op, and nothing is delivered twice.
pub struct OutcomeAccumulator {
    txn_id: TxnId,
    f_inc: usize,
    acceptors: BTreeSet<ReplicaId>,
    /// Distinct outcomes seen so far, with their current vote counts.
    outcomes: Vec<(Outcome, usize)>,
    received: BTreeMap<ReplicaId, usize>,
    delivered: bool,
}

impl OutcomeAccumulator {
    #[must_use]
    pub fn new(txn_id: TxnId, f_inc: usize, acceptors: &[ReplicaId]) -> Self {
        Self {
            txn_id,
            f_inc,
            acceptors: acceptors.iter().copied().collect(),
            outcomes: Vec::new(),
            received: BTreeMap::new(),
            delivered: false,
        }
    }

    /// Record `sender`'s reported outcome. Returns the agreed outcome the
    /// first time `f_inc` acceptors match.
    pub fn outcome_received(&mut self, sender: ReplicaId, outcome: Outcome) -> Option<Outcome> {
        if self.delivered {
            return None;
        }
        if !self.acceptors.contains(&sender) {
            warn!(txn = %self.txn_id, replica = %sender, "outcome from non-acceptor");
            return None;
        }

        let idx = match self.outcomes.iter().position(|(o, _)| *o == outcome) {
            Some(idx) => idx,
            None => {
                self.outcomes.push((outcome, 0));
                self.outcomes.len() - 1
            }
        };
        if self.received.get(&sender) == Some(&idx) {
            return None;
        }
        if let Some(previous) = self.received.insert(sender, idx) {
            self.outcomes[previous].1 -= 1;
        }
        self.outcomes[idx].1 += 1;
        trace!(txn = %self.txn_id, replica = %sender, count = self.outcomes[idx].1,
            quorum = self.f_inc, "outcome received");

        if self.outcomes[idx].1 >= self.f_inc {
            self.delivered = true;
            Some(self.outcomes[idx].0.clone())
        } else {
            None
        }
    }
}
