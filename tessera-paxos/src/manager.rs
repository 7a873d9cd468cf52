//! Async shell around the acceptor state machine.
//!
//! An [`AcceptorManager`] owns every acceptor for its shard. All acceptor
//! state is mutated only from work items on the manager's executor; disk
//! futures are awaited on spawned tasks and their completions posted back
//! as fresh work items, so the executor never stalls on I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use tessera_core::{Message, ReplicaId, Txn, TxnId, VarId};
use tessera_dispatch::{Dispatcher, Executor};

use crate::acceptor::{Acceptor, DurableAcceptorState, Effect};
use crate::ballot::Ballot;
use crate::disk::{Disk, Table};
use crate::network::{ConnectionManager, Sender};
use crate::sender::{TwoBSender, send_one_shot};

struct Shared {
    exe: Executor,
    disk: Arc<dyn Disk>,
    connection_manager: Arc<dyn ConnectionManager>,
}

#[derive(Default)]
struct Inner {
    acceptors: HashMap<TxnId, Acceptor>,
    two_b_senders: HashMap<TxnId, Arc<TwoBSender>>,
}

/// Owns the acceptors of one shard, keyed by transaction identifier.
///
/// An acceptor is created on the first ballot for its transaction, or
/// reconstructed from a durable record via
/// [`load_from_disk`](AcceptorManager::load_from_disk). It is dropped
/// exactly once, after its delete-from-disk step completes and TGC has been
/// dispatched.
pub struct AcceptorManager {
    shared: Arc<Shared>,
    inner: Arc<Mutex<Inner>>,
}

impl AcceptorManager {
    #[must_use]
    pub fn new(
        exe: Executor,
        disk: Arc<dyn Disk>,
        connection_manager: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                exe,
                disk,
                connection_manager,
            }),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.shared.exe
    }

    /// A Paxos instance accepted a ballot for `txn_id`. Creates the
    /// acceptor on the first ballot.
    pub fn ballot_accepted(
        &self,
        replica: ReplicaId,
        txn_id: TxnId,
        var: VarId,
        ballot: Ballot,
        txn: Txn,
    ) {
        let shared = self.shared.clone();
        let inner_arc = self.inner.clone();
        let accepted = self.shared.exe.enqueue(move || {
            let mut inner = inner_arc.lock().expect("manager lock poisoned");
            let effects = inner
                .acceptors
                .entry(txn_id)
                .or_insert_with(|| Acceptor::new(txn_id, txn))
                .ballot_accepted(replica, var, ballot);
            apply_effects(&shared, &inner_arc, &mut inner, txn_id, effects);
        });
        if !accepted {
            warn!(txn = %txn_id, "ballot dropped: manager executor is shut down");
        }
    }

    /// `sender` has applied `txn_id`'s outcome locally.
    ///
    /// A TLC for an unknown transaction means the acceptor already finished;
    /// the sender is told so with a `TxnGloballyComplete` so it stops
    /// retransmitting.
    pub fn txn_locally_complete_received(&self, txn_id: TxnId, sender: ReplicaId) {
        let shared = self.shared.clone();
        let inner_arc = self.inner.clone();
        let _ = self.shared.exe.enqueue(move || {
            let mut inner = inner_arc.lock().expect("manager lock poisoned");
            if let Some(acceptor) = inner.acceptors.get_mut(&txn_id) {
                let effects = acceptor.txn_locally_complete_received(sender);
                apply_effects(&shared, &inner_arc, &mut inner, txn_id, effects);
            } else {
                debug!(txn = %txn_id, replica = %sender, "TLC for finished acceptor");
                send_one_shot(
                    &shared.connection_manager,
                    Message::TxnGloballyComplete { txn_id }.encode(),
                    [sender],
                );
            }
        });
    }

    /// The submitter has collected enough matching outcomes for `txn_id`.
    pub fn txn_submission_complete_received(&self, txn_id: TxnId, sender: ReplicaId) {
        let shared = self.shared.clone();
        let inner_arc = self.inner.clone();
        let _ = self.shared.exe.enqueue(move || {
            let mut inner = inner_arc.lock().expect("manager lock poisoned");
            if let Some(acceptor) = inner.acceptors.get_mut(&txn_id) {
                let effects = acceptor.txn_submission_complete_received(sender);
                apply_effects(&shared, &inner_arc, &mut inner, txn_id, effects);
            } else {
                debug!(txn = %txn_id, replica = %sender, "TSC for finished acceptor");
            }
        });
    }

    /// Reconstruct an acceptor from its durable record. The record is
    /// already on disk, so the acceptor resumes in `AwaitLocallyComplete`
    /// without rewriting.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid durable record.
    pub fn load_from_disk(&self, txn_id: TxnId, bytes: &[u8]) -> Result<(), postcard::Error> {
        let data = DurableAcceptorState::decode(bytes)?;
        let shared = self.shared.clone();
        let inner_arc = self.inner.clone();
        let _ = self.shared.exe.enqueue(move || {
            let (acceptor, effects) = Acceptor::from_data(txn_id, data);
            let mut inner = inner_arc.lock().expect("manager lock poisoned");
            inner.acceptors.insert(txn_id, acceptor);
            apply_effects(&shared, &inner_arc, &mut inner, txn_id, effects);
        });
        Ok(())
    }

    /// The transactions with a live acceptor, observed from the manager's
    /// executor.
    pub async fn live_transactions(&self) -> Vec<TxnId> {
        let inner_arc = self.inner.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let accepted = self.shared.exe.enqueue(move || {
            let inner = inner_arc.lock().expect("manager lock poisoned");
            let mut txns: Vec<TxnId> = inner.acceptors.keys().copied().collect();
            txns.sort_unstable();
            let _ = tx.send(txns);
        });
        if !accepted {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Perform the effects a transition requested. Runs on the manager's
/// executor with the state lock held.
fn apply_effects(
    shared: &Arc<Shared>,
    inner_arc: &Arc<Mutex<Inner>>,
    inner: &mut Inner,
    txn_id: TxnId,
    effects: Vec<Effect>,
) {
    for effect in effects {
        match effect {
            Effect::WriteOutcome { seq, record } => {
                let outcome = record.outcome.clone();
                let send_to_all = record.send_to_all;
                let data = record.encode();
                let key = *txn_id.as_bytes();
                let future = shared.disk.read_write_transaction(
                    false,
                    Box::new(move |rw| rw.put(Table::BallotOutcomes, &key, &data)),
                );
                let shared = shared.clone();
                let inner_arc = inner_arc.clone();
                tokio::spawn(async move {
                    if let Err(e) = future.result().await {
                        error!(txn = %txn_id, error = %e, "acceptor write failed");
                        return;
                    }
                    let completion_shared = shared.clone();
                    let _ = shared.exe.enqueue(move || {
                        let mut inner = inner_arc.lock().expect("manager lock poisoned");
                        let Some(acceptor) = inner.acceptors.get_mut(&txn_id) else {
                            return;
                        };
                        let effects = acceptor.write_done(seq, outcome, send_to_all);
                        apply_effects(&completion_shared, &inner_arc, &mut inner, txn_id, effects);
                    });
                });
            }
            Effect::DeleteOutcome => {
                let key = *txn_id.as_bytes();
                let future = shared.disk.read_write_transaction(
                    false,
                    Box::new(move |rw| rw.del(Table::BallotOutcomes, &key)),
                );
                let shared = shared.clone();
                let inner_arc = inner_arc.clone();
                tokio::spawn(async move {
                    if let Err(e) = future.result().await {
                        error!(txn = %txn_id, error = %e, "acceptor deletion failed");
                        return;
                    }
                    let completion_shared = shared.clone();
                    let _ = shared.exe.enqueue(move || {
                        let mut inner = inner_arc.lock().expect("manager lock poisoned");
                        let Some(acceptor) = inner.acceptors.get_mut(&txn_id) else {
                            return;
                        };
                        let effects = acceptor.deletion_done();
                        apply_effects(&completion_shared, &inner_arc, &mut inner, txn_id, effects);
                    });
                });
            }
            Effect::RemoveTwoBSender => {
                if let Some(sender) = inner.two_b_senders.remove(&txn_id) {
                    let sender: Arc<dyn Sender> = sender;
                    shared.connection_manager.remove_sender_sync(&sender);
                }
            }
            Effect::InstallTwoBSender {
                outcome,
                submitter,
                recipients,
            } => {
                let sender = Arc::new(TwoBSender::new(txn_id, &outcome, submitter, recipients));
                inner.two_b_senders.insert(txn_id, sender.clone());
                shared.connection_manager.add_sender(sender);
            }
            Effect::Finished { tgc_recipients } => {
                inner.acceptors.remove(&txn_id);
                if let Some(sender) = inner.two_b_senders.remove(&txn_id) {
                    let sender: Arc<dyn Sender> = sender;
                    shared.connection_manager.remove_sender_sync(&sender);
                }
                debug!(txn = %txn_id, ?tgc_recipients, "sending TGC");
                send_one_shot(
                    &shared.connection_manager,
                    Message::TxnGloballyComplete { txn_id }.encode(),
                    tgc_recipients,
                );
            }
        }
    }
}

/// Shards acceptors across a fixed set of executors by transaction
/// identifier, one manager per executor.
pub struct AcceptorDispatcher {
    dispatcher: Dispatcher,
    managers: Vec<AcceptorManager>,
}

impl AcceptorDispatcher {
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn new(
        count: usize,
        disk: Arc<dyn Disk>,
        connection_manager: Arc<dyn ConnectionManager>,
    ) -> Self {
        let dispatcher = Dispatcher::new(count);
        let managers = (0..count)
            .map(|idx| {
                let key = u64::try_from(idx).expect("executor index fits u64");
                AcceptorManager::new(
                    dispatcher.executor_for(key).clone(),
                    disk.clone(),
                    connection_manager.clone(),
                )
            })
            .collect();
        Self {
            dispatcher,
            managers,
        }
    }

    /// The manager owning `txn_id`'s shard.
    #[must_use]
    pub fn manager_for(&self, txn_id: &TxnId) -> &AcceptorManager {
        let idx = usize::try_from(txn_id.shard_key() % self.managers.len() as u64)
            .expect("index fits usize");
        &self.managers[idx]
    }

    /// Shut down every shard executor, draining queued work first.
    pub async fn shutdown(self) {
        drop(self.managers);
        self.dispatcher.shutdown().await;
    }
}
