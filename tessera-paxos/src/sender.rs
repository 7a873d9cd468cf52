//! Sender implementations.
//!
//! All senders carry their message bytes pre-encoded so that
//! reconnect-driven resends never re-serialize anything.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, trace};

use tessera_core::{Message, Outcome, ReplicaId, TxnId};

use crate::network::{Connection, ConnectionManager, Connections, Sender};

// ---------------------------------------------------------------------------
// Repeating sender
// ---------------------------------------------------------------------------

/// Retransmits fixed bytes to a fixed recipient set on registration and on
/// every reconnect, until deregistered.
///
/// This is the wire-layer retry mechanism: the submitter keeps one of these
/// registered per in-flight transaction until an outcome is delivered.
pub struct RepeatingSender {
    msg: Bytes,
    recipients: Vec<ReplicaId>,
}

impl RepeatingSender {
    #[must_use]
    pub fn new(msg: Bytes, recipients: Vec<ReplicaId>) -> Self {
        Self { msg, recipients }
    }
}

impl Sender for RepeatingSender {
    fn connected_replicas(&self, connections: &Connections) {
        for replica in &self.recipients {
            if let Some(conn) = connections.get(replica) {
                conn.send(self.msg.clone());
            }
        }
    }

    fn connection_established(
        &self,
        replica: ReplicaId,
        connection: &Arc<dyn Connection>,
        _connections: &Connections,
    ) {
        if self.recipients.contains(&replica) {
            connection.send(self.msg.clone());
        }
    }

    fn connection_lost(&self, _replica: ReplicaId, _connections: &Connections) {}
}

// ---------------------------------------------------------------------------
// One-shot sender
// ---------------------------------------------------------------------------

struct OneShotSender {
    msg: Bytes,
    remaining: Mutex<BTreeSet<ReplicaId>>,
    connection_manager: Arc<dyn ConnectionManager>,
    this: Weak<OneShotSender>,
}

impl OneShotSender {
    fn send_pending(&self, connections: &Connections) {
        let mut remaining = self.remaining.lock().expect("one-shot lock poisoned");
        remaining.retain(|replica| match connections.get(replica) {
            Some(conn) => {
                conn.send(self.msg.clone());
                false
            }
            None => true,
        });
        let done = remaining.is_empty();
        drop(remaining);
        if done {
            self.deregister();
        }
    }

    fn deregister(&self) {
        if let Some(me) = self.this.upgrade() {
            let me: Arc<dyn Sender> = me;
            self.connection_manager.remove_sender_async(&me);
        }
    }
}

impl Sender for OneShotSender {
    fn connected_replicas(&self, connections: &Connections) {
        self.send_pending(connections);
    }

    fn connection_established(
        &self,
        replica: ReplicaId,
        connection: &Arc<dyn Connection>,
        _connections: &Connections,
    ) {
        let mut remaining = self.remaining.lock().expect("one-shot lock poisoned");
        let wanted = remaining.remove(&replica);
        let done = remaining.is_empty();
        drop(remaining);
        if wanted {
            connection.send(self.msg.clone());
            if done {
                self.deregister();
            }
        }
    }

    fn connection_lost(&self, _replica: ReplicaId, _connections: &Connections) {}
}

/// Send `msg` once to each of `recipients`, as connections permit.
///
/// Registers a self-removing sender with the connection manager: recipients
/// connected right now are served immediately, the rest as they connect.
/// Once every recipient has been served the sender deregisters itself.
pub fn send_one_shot(
    connection_manager: &Arc<dyn ConnectionManager>,
    msg: Bytes,
    recipients: impl IntoIterator<Item = ReplicaId>,
) {
    let remaining: BTreeSet<ReplicaId> = recipients.into_iter().collect();
    if remaining.is_empty() {
        return;
    }
    let sender = Arc::new_cyclic(|this| OneShotSender {
        msg,
        remaining: Mutex::new(remaining),
        connection_manager: connection_manager.clone(),
        this: this.clone(),
    });
    connection_manager.add_sender(sender);
}

// ---------------------------------------------------------------------------
// 2B sender
// ---------------------------------------------------------------------------

/// Retransmitting sender for an acceptor's durable outcome.
///
/// Carries the pre-encoded 2B message for the participating replicas and a
/// separate pre-encoded `SubmissionOutcome` for the submitter. Aborts are
/// rewritten to `Resubmit` in the submitter copy, omitting update payloads.
pub struct TwoBSender {
    msg: Bytes,
    recipients: Vec<ReplicaId>,
    submitter_msg: Bytes,
    submitter: ReplicaId,
}

impl TwoBSender {
    #[must_use]
    pub fn new(
        txn_id: TxnId,
        outcome: &Outcome,
        submitter: ReplicaId,
        recipients: Vec<ReplicaId>,
    ) -> Self {
        let submitter_msg = Message::SubmissionOutcome {
            txn_id,
            outcome: outcome.for_submitter(),
        }
        .encode();
        let msg = Message::TwoBTxnVotes {
            txn_id,
            outcome: outcome.clone(),
        }
        .encode();
        debug!(txn = %txn_id, ?recipients, "2B sender created");
        Self {
            msg,
            recipients,
            submitter_msg,
            submitter,
        }
    }
}

impl Sender for TwoBSender {
    fn connected_replicas(&self, connections: &Connections) {
        if let Some(conn) = connections.get(&self.submitter) {
            conn.send(self.submitter_msg.clone());
        }
        for replica in &self.recipients {
            if let Some(conn) = connections.get(replica) {
                conn.send(self.msg.clone());
            }
        }
    }

    fn connection_established(
        &self,
        replica: ReplicaId,
        connection: &Arc<dyn Connection>,
        _connections: &Connections,
    ) {
        if self.submitter == replica {
            connection.send(self.submitter_msg.clone());
        }
        if self.recipients.contains(&replica) {
            trace!(replica = %replica, "resending 2B");
            connection.send(self.msg.clone());
        }
    }

    fn connection_lost(&self, _replica: ReplicaId, _connections: &Connections) {}
}
