//! The acceptor state machine - pure transitions, no I/O.
//!
//! One acceptor exists per transaction. It moves through four states:
//!
//! ```text
//! ReceiveBallots ── outcome determined ──▶ WriteToDisk ──▶ AwaitLocallyComplete ──▶ DeleteFromDisk
//!        ▲                                                        │
//!        └────────── outcome changed (new ballot) ────────────────┘ re-enter WriteToDisk
//! ```
//!
//! Every event handler returns the [`Effect`]s the manager must perform
//! (disk writes, sender registration, final TGC dispatch). Keeping the
//! transitions pure lets the whole machine be unit tested without an
//! executor, a disk or a connection manager; the async shell lives in
//! [`manager`](crate::manager).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use tessera_core::{Outcome, ReplicaId, Txn, TxnId, VarId};

use crate::ballot::{Ballot, BallotAccumulator, InstanceRecord};

/// The record persisted under `BallotOutcomes[txn_id]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableAcceptorState {
    pub txn: Txn,
    pub outcome: Outcome,
    pub send_to_all: bool,
    pub instances: Vec<InstanceRecord>,
}

impl DurableAcceptorState {
    /// # Panics
    ///
    /// Panics if postcard serialization fails (should not happen for this
    /// type).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("serialization should not fail")
    }

    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoded record.
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    ReceiveBallots,
    WriteToDisk,
    AwaitLocallyComplete,
    DeleteFromDisk,
}

/// Side effect requested by a state transition.
#[derive(Debug)]
pub(crate) enum Effect {
    /// Persist the record under `BallotOutcomes[txn_id]`. The completion
    /// must be posted back as `write_done(seq, outcome, send_to_all)`.
    WriteOutcome {
        seq: u64,
        record: DurableAcceptorState,
    },
    /// Delete `BallotOutcomes[txn_id]`; post the completion back as
    /// `deletion_done()`.
    DeleteOutcome,
    /// Deregister the current 2B sender.
    RemoveTwoBSender,
    /// Build and register a 2B sender for the durable outcome.
    InstallTwoBSender {
        outcome: Outcome,
        submitter: ReplicaId,
        recipients: Vec<ReplicaId>,
    },
    /// The acceptor is done: drop it and dispatch TGC to the recipients.
    Finished { tgc_recipients: Vec<ReplicaId> },
}

pub(crate) struct Acceptor {
    txn_id: TxnId,
    txn: Txn,
    state: State,
    accumulator: BallotAccumulator,
    outcome: Option<Outcome>,
    outcome_on_disk: Option<Outcome>,
    send_to_all: bool,
    send_to_all_on_disk: bool,
    /// Bumped for every scheduled write; completions carrying a stale
    /// sequence are dropped (a newer outcome drives a fresh write).
    write_seq: u64,
    pending_tlc: BTreeSet<ReplicaId>,
    tlcs_received: BTreeSet<ReplicaId>,
    tgc_recipients: Vec<ReplicaId>,
    tsc_received: bool,
    two_b_installed: bool,
}

impl Acceptor {
    /// A fresh acceptor, created on the first ballot for `txn_id`.
    pub(crate) fn new(txn_id: TxnId, txn: Txn) -> Self {
        let accumulator = BallotAccumulator::new(txn_id, &txn);
        Self {
            txn_id,
            txn,
            state: State::ReceiveBallots,
            accumulator,
            outcome: None,
            outcome_on_disk: None,
            send_to_all: false,
            send_to_all_on_disk: false,
            write_seq: 0,
            pending_tlc: BTreeSet::new(),
            tlcs_received: BTreeSet::new(),
            tgc_recipients: Vec::new(),
            tsc_received: false,
            two_b_installed: false,
        }
    }

    /// Reconstruct an acceptor from its durable record after a restart.
    ///
    /// Starts in `AwaitLocallyComplete` with the persisted outcome: the
    /// record is already durable, so nothing is rewritten. The returned
    /// effects re-register the 2B sender.
    pub(crate) fn from_data(txn_id: TxnId, data: DurableAcceptorState) -> (Self, Vec<Effect>) {
        let accumulator = BallotAccumulator::from_records(txn_id, &data.txn, data.instances);
        let mut acceptor = Self {
            txn_id,
            txn: data.txn,
            state: State::AwaitLocallyComplete,
            accumulator,
            outcome: Some(data.outcome.clone()),
            outcome_on_disk: Some(data.outcome),
            send_to_all: data.send_to_all,
            send_to_all_on_disk: data.send_to_all,
            write_seq: 0,
            pending_tlc: BTreeSet::new(),
            tlcs_received: BTreeSet::new(),
            tgc_recipients: Vec::new(),
            tsc_received: false,
            two_b_installed: false,
        };
        let effects = acceptor.enter_await_locally_complete();
        (acceptor, effects)
    }

    /// A ballot was accepted by `replica`'s instance for `var`.
    pub(crate) fn ballot_accepted(
        &mut self,
        replica: ReplicaId,
        var: VarId,
        ballot: Ballot,
    ) -> Vec<Effect> {
        if self.state == State::DeleteFromDisk {
            error!(txn = %self.txn_id, %replica,
                "ballot received after all TLCs; ignoring");
            return Vec::new();
        }
        let Some(outcome) = self.accumulator.ballot_received(replica, var, ballot) else {
            return Vec::new();
        };
        if self.outcome.as_ref() == Some(&outcome) {
            return Vec::new();
        }
        self.outcome = Some(outcome.clone());
        self.state = State::WriteToDisk;
        vec![self.schedule_write(outcome)]
    }

    fn schedule_write(&mut self, outcome: Outcome) -> Effect {
        // A commit must be announced to every participating replica, not
        // only the actives; once raised, the flag never drops.
        self.send_to_all = self.send_to_all || outcome.is_commit();
        self.write_seq += 1;
        debug!(txn = %self.txn_id, seq = self.write_seq, "writing outcome to disk");
        Effect::WriteOutcome {
            seq: self.write_seq,
            record: DurableAcceptorState {
                txn: self.txn.clone(),
                outcome,
                send_to_all: self.send_to_all,
                instances: self.accumulator.records(),
            },
        }
    }

    /// A durable write completed. Outcomes can be determined in quick
    /// succession; this completion only "won" if no newer write has been
    /// scheduled and the state is still `WriteToDisk`.
    pub(crate) fn write_done(
        &mut self,
        seq: u64,
        outcome: Outcome,
        send_to_all: bool,
    ) -> Vec<Effect> {
        if seq != self.write_seq || self.state != State::WriteToDisk {
            debug!(txn = %self.txn_id, seq, current = self.write_seq, "stale write completion");
            return Vec::new();
        }
        self.outcome_on_disk = Some(outcome);
        self.send_to_all_on_disk = send_to_all;
        self.state = State::AwaitLocallyComplete;
        self.enter_await_locally_complete()
    }

    /// Entering `AwaitLocallyComplete`: rebuild the recipient sets from the
    /// allocations and either proceed straight to deletion or install a new
    /// 2B sender.
    ///
    /// TLCs recorded before an outcome change are kept: a TLC acknowledges
    /// the replica's participation, not a specific outcome, and TLC
    /// handling is idempotent on the receiving side.
    fn enter_await_locally_complete(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.two_b_installed {
            self.two_b_installed = false;
            effects.push(Effect::RemoveTwoBSender);
        }

        let Some(outcome) = self.outcome_on_disk.clone() else {
            error!(txn = %self.txn_id, "await-locally-complete without durable outcome");
            return effects;
        };
        let aborted = !outcome.is_commit();

        self.pending_tlc.clear();
        self.tgc_recipients.clear();
        let mut two_b_recipients = Vec::with_capacity(self.txn.allocations.len());
        for alloc in &self.txn.allocations {
            let active = alloc.is_active();
            if self.send_to_all_on_disk || active {
                two_b_recipients.push(alloc.replica);
                if !self.tlcs_received.contains(&alloc.replica) {
                    self.pending_tlc.insert(alloc.replica);
                }
            }
            // Passive replicas of an aborted transaction received no 2B,
            // so they get no TGC either.
            if !aborted || active {
                self.tgc_recipients.push(alloc.replica);
            }
        }

        if self.pending_tlc.is_empty() && self.tsc_received {
            self.state = State::DeleteFromDisk;
            effects.push(Effect::DeleteOutcome);
        } else {
            self.two_b_installed = true;
            effects.push(Effect::InstallTwoBSender {
                outcome,
                submitter: self.txn.submitter,
                recipients: two_b_recipients,
            });
        }
        effects
    }

    /// `sender` has applied the outcome locally.
    pub(crate) fn txn_locally_complete_received(&mut self, sender: ReplicaId) -> Vec<Effect> {
        self.tlcs_received.insert(sender);
        if self.state == State::AwaitLocallyComplete {
            self.pending_tlc.remove(&sender);
            self.maybe_delete()
        } else {
            Vec::new()
        }
    }

    /// The submitter has collected enough matching outcomes. This can
    /// arrive before any TLC.
    pub(crate) fn txn_submission_complete_received(&mut self, _sender: ReplicaId) -> Vec<Effect> {
        if self.tsc_received {
            return Vec::new();
        }
        self.tsc_received = true;
        self.maybe_delete()
    }

    fn maybe_delete(&mut self) -> Vec<Effect> {
        if self.state != State::AwaitLocallyComplete
            || !self.tsc_received
            || !self.pending_tlc.is_empty()
        {
            return Vec::new();
        }
        self.state = State::DeleteFromDisk;
        let mut effects = Vec::new();
        if self.two_b_installed {
            self.two_b_installed = false;
            effects.push(Effect::RemoveTwoBSender);
        }
        effects.push(Effect::DeleteOutcome);
        effects
    }

    /// The durable record was deleted; the acceptor is finished.
    pub(crate) fn deletion_done(&mut self) -> Vec<Effect> {
        if self.state != State::DeleteFromDisk {
            return Vec::new();
        }
        debug!(txn = %self.txn_id, "acceptor finished");
        vec![Effect::Finished {
            tgc_recipients: self.tgc_recipients.clone(),
        }]
    }
}
