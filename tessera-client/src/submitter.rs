//! The transaction submitter.
//!
//! Owns the per-submitter state: in-flight transactions, submissions
//! buffered while the topology is blank, the position cache, and the set of
//! currently reachable replicas. All state lives behind one executor; the
//! public methods enqueue work items and never touch the state directly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use error_stack::Report;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tessera_core::{
    BootCount, ClientTxn, Message, Outcome, Positions, ReplicaId, Topology, Txn, TxnId, VarId,
};
use tessera_dispatch::Executor;
use tessera_paxos::{
    ConnectionManager, Connections, OutcomeAccumulator, RepeatingSender, Sender, send_one_shot,
};

use crate::cache::PositionCache;
use crate::error::SubmitError;
use crate::resolver::Resolver;
use crate::translate;

/// Invoked with the transaction's outcome, or `None` if the submitter shut
/// down first.
pub type TxnCompletion = Box<dyn FnOnce(TxnId, Option<Outcome>) + Send + 'static>;

/// Handle identifying a registered shutdown hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HookId(u64);

struct ActiveTxn {
    accumulator: OutcomeAccumulator,
    continuation: Option<TxnCompletion>,
    sender: Arc<RepeatingSender>,
    acceptors: Vec<ReplicaId>,
    active_replicas: Vec<ReplicaId>,
    retry: bool,
    hook: HookId,
}

struct Buffered {
    ctxn: ClientTxn,
    continuation: TxnCompletion,
    delay: Duration,
}

struct Inner {
    local: ReplicaId,
    boot_count: BootCount,
    topology: Topology,
    cache: PositionCache,
    disabled: BTreeSet<ReplicaId>,
    connections: Connections,
    connection_manager: Arc<dyn ConnectionManager>,
    in_flight: HashMap<TxnId, ActiveTxn>,
    shutdown_hooks: BTreeMap<HookId, TxnId>,
    next_hook: u64,
    buffered: Vec<Buffered>,
}

/// Handle to a submitter running on one executor.
pub struct TxnSubmitter {
    exe: Executor,
    inner: Arc<Mutex<Inner>>,
}

impl TxnSubmitter {
    #[must_use]
    pub fn new(
        local: ReplicaId,
        boot_count: BootCount,
        topology: Topology,
        connection_manager: Arc<dyn ConnectionManager>,
        exe: Executor,
    ) -> Self {
        let mut cache = PositionCache::new(
            Resolver::new(&topology.all_replicas),
            StdRng::from_os_rng(),
        );
        if let Some(root) = &topology.root {
            cache.add_position(root.var, root.positions.clone());
        }
        // Nothing is reachable until a connection set arrives.
        let disabled = topology.all_replicas.iter().copied().collect();
        Self {
            exe,
            inner: Arc::new(Mutex::new(Inner {
                local,
                boot_count,
                topology,
                cache,
                disabled,
                connections: Connections::new(),
                connection_manager,
                in_flight: HashMap::new(),
                shutdown_hooks: BTreeMap::new(),
                next_hook: 0,
                buffered: Vec::new(),
            })),
        }
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.exe
    }

    /// Translate and submit a client transaction.
    ///
    /// While the topology is blank the submission is buffered and `Ok` is
    /// returned; buffered submissions replay in order once a topology
    /// arrives.
    ///
    /// # Errors
    ///
    /// Translation and routing errors are surfaced here, synchronously to
    /// the caller; the continuation is not invoked in that case.
    pub async fn submit_client_txn(
        &self,
        ctxn: ClientTxn,
        continuation: TxnCompletion,
        delay: Duration,
    ) -> Result<(), Report<SubmitError>> {
        let inner_arc = self.inner.clone();
        let (tx, rx) = oneshot::channel();
        let accepted = self.exe.enqueue(move || {
            let mut inner = inner_arc.lock().expect("submitter lock poisoned");
            let result = inner
                .submit_client_txn(ctxn, continuation, delay)
                .map_err(|(report, _continuation)| report);
            let _ = tx.send(result);
        });
        if !accepted {
            return Err(Report::new(SubmitError::Shutdown));
        }
        rx.await
            .unwrap_or_else(|_| Err(Report::new(SubmitError::Shutdown)))
    }

    /// Submit an already-translated server transaction.
    pub fn submit_txn(
        &self,
        txn: Txn,
        active: Vec<ReplicaId>,
        continuation: TxnCompletion,
        delay: Duration,
    ) {
        let inner_arc = self.inner.clone();
        let _ = self.exe.enqueue(move || {
            inner_arc
                .lock()
                .expect("submitter lock poisoned")
                .submit_txn(txn, active, continuation, delay);
        });
    }

    /// Route an acceptor-reported outcome to its transaction.
    pub fn submission_outcome_received(&self, sender: ReplicaId, txn_id: TxnId, outcome: Outcome) {
        let inner_arc = self.inner.clone();
        let _ = self.exe.enqueue(move || {
            inner_arc
                .lock()
                .expect("submitter lock poisoned")
                .submission_outcome_received(sender, txn_id, outcome);
        });
    }

    /// Adopt a new topology and/or connection set.
    pub fn topology_change(&self, topology: Option<Topology>, connections: Option<Connections>) {
        let inner_arc = self.inner.clone();
        let _ = self.exe.enqueue(move || {
            inner_arc
                .lock()
                .expect("submitter lock poisoned")
                .topology_change(topology, connections);
        });
    }

    /// Bulk-insert known object positions.
    pub fn ensure_positions(&self, positions: HashMap<VarId, Positions>) {
        let inner_arc = self.inner.clone();
        let _ = self.exe.enqueue(move || {
            let mut inner = inner_arc.lock().expect("submitter lock poisoned");
            for (var, pos) in positions {
                inner.cache.add_position(var, pos);
            }
        });
    }

    /// Run every registered shutdown hook: in-flight continuations are
    /// invoked with `None`, retry transactions broadcast an abort
    /// resubmission to their active replicas.
    pub async fn shutdown(&self) {
        let inner_arc = self.inner.clone();
        let (tx, rx) = oneshot::channel();
        let accepted = self.exe.enqueue(move || {
            inner_arc
                .lock()
                .expect("submitter lock poisoned")
                .shutdown();
            let _ = tx.send(());
        });
        if accepted {
            let _ = rx.await;
        }
    }
}

impl Inner {
    fn submit_client_txn(
        &mut self,
        ctxn: ClientTxn,
        continuation: TxnCompletion,
        delay: Duration,
    ) -> Result<(), (Report<SubmitError>, TxnCompletion)> {
        if self.topology.is_blank() {
            debug!(txn = %ctxn.id, "topology blank; buffering submission");
            self.buffered.push(Buffered {
                ctxn,
                continuation,
                delay,
            });
            return Ok(());
        }
        let translated = translate::client_to_server(
            &ctxn,
            self.local,
            self.boot_count,
            &self.topology,
            &mut self.cache,
            &self.disabled,
            &self.connections,
        );
        match translated {
            Ok((txn, active, _passive)) => {
                self.submit_txn(txn, active, continuation, delay);
                Ok(())
            }
            Err(report) => Err((report, continuation)),
        }
    }

    fn submit_txn(
        &mut self,
        txn: Txn,
        active: Vec<ReplicaId>,
        continuation: TxnCompletion,
        delay: Duration,
    ) {
        let txn_id = txn.id;
        debug!(txn = %txn_id, ?active, "submitting txn");
        let msg = Message::TxnSubmission(txn.clone()).encode();
        let sender = Arc::new(RepeatingSender::new(msg, active.clone()));
        if delay.is_zero() {
            self.connection_manager.add_sender(sender.clone());
        } else {
            let connection_manager = self.connection_manager.clone();
            let delayed = sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                connection_manager.add_sender(delayed);
            });
        }

        let acceptors = txn.acceptors();
        let hook = HookId(self.next_hook);
        self.next_hook += 1;
        self.shutdown_hooks.insert(hook, txn_id);
        self.in_flight.insert(
            txn_id,
            ActiveTxn {
                accumulator: OutcomeAccumulator::new(txn_id, usize::from(txn.f_inc), &acceptors),
                continuation: Some(continuation),
                sender,
                acceptors,
                active_replicas: active,
                retry: txn.retry,
                hook,
            },
        );
    }

    fn submission_outcome_received(&mut self, sender: ReplicaId, txn_id: TxnId, outcome: Outcome) {
        let decided = match self.in_flight.get_mut(&txn_id) {
            Some(active_txn) => active_txn.accumulator.outcome_received(sender, outcome),
            None => {
                // Already completed (or never ours): tell the acceptor so
                // it can free its state for this transaction.
                debug!(txn = %txn_id, replica = %sender, "outcome for unknown txn");
                send_one_shot(
                    &self.connection_manager,
                    Message::TxnSubmissionComplete { txn_id }.encode(),
                    [sender],
                );
                return;
            }
        };
        let Some(decided) = decided else { return };

        let mut active_txn = self.in_flight.remove(&txn_id).expect("checked above");
        self.shutdown_hooks.remove(&active_txn.hook);
        self.release(txn_id, &mut active_txn, false);
        if let Some(continuation) = active_txn.continuation.take() {
            continuation(txn_id, Some(decided));
        }
    }

    /// Deregister the repeating sender and let the acceptors free their
    /// state. On shutdown, additionally broadcast an abort resubmission for
    /// retries and fail the continuation.
    fn release(&mut self, txn_id: TxnId, active_txn: &mut ActiveTxn, shutdown: bool) {
        let sender: Arc<dyn Sender> = active_txn.sender.clone();
        self.connection_manager.remove_sender_async(&sender);
        send_one_shot(
            &self.connection_manager,
            Message::TxnSubmissionComplete { txn_id }.encode(),
            active_txn.acceptors.iter().copied(),
        );
        if shutdown {
            if active_txn.retry {
                send_one_shot(
                    &self.connection_manager,
                    Message::TxnSubmissionAbort { txn_id }.encode(),
                    active_txn.active_replicas.iter().copied(),
                );
            }
            if let Some(continuation) = active_txn.continuation.take() {
                continuation(txn_id, None);
            }
        }
    }

    fn topology_change(&mut self, topology: Option<Topology>, connections: Option<Connections>) {
        if let Some(topology) = topology {
            debug!(version = topology.version, "adopting topology");
            self.cache
                .set_resolver(Resolver::new(&topology.all_replicas));
            if let Some(root) = &topology.root {
                self.cache.add_position(root.var, root.positions.clone());
            }
            self.topology = topology;
        }
        if let Some(connections) = connections {
            self.disabled = self
                .topology
                .all_replicas
                .iter()
                .copied()
                .filter(|replica| !connections.contains_key(replica))
                .collect();
            debug!(disabled = ?self.disabled, "adopting connection set");
            self.connections = connections;
        }
        if !self.topology.is_blank() && !self.buffered.is_empty() {
            for buffered in std::mem::take(&mut self.buffered) {
                let txn_id = buffered.ctxn.id;
                if let Err((report, continuation)) =
                    self.submit_client_txn(buffered.ctxn, buffered.continuation, buffered.delay)
                {
                    warn!(txn = %txn_id, error = ?report, "buffered submission failed");
                    continuation(txn_id, None);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        debug!(in_flight = self.in_flight.len(), "submitter shutting down");
        for (_, txn_id) in std::mem::take(&mut self.shutdown_hooks) {
            if let Some(mut active_txn) = self.in_flight.remove(&txn_id) {
                self.release(txn_id, &mut active_txn, true);
            }
        }
        // Buffered submissions never started; fail their continuations.
        for buffered in std::mem::take(&mut self.buffered) {
            (buffered.continuation)(buffered.ctxn.id, None);
        }
    }
}
