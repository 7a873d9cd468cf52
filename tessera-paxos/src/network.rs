//! Connection-manager contract.
//!
//! The wire-level connection manager is an external collaborator: a registry
//! mapping replica identifiers to send-capable connections. The coordination
//! core only relies on the contract below. Registration and removal must be
//! callable from any executor; the manager invokes sender callbacks on its
//! own thread(s), so senders synchronize their own state.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use tessera_core::{BootCount, ReplicaId};

/// A live connection to one replica.
pub trait Connection: Send + Sync {
    /// Queue pre-encoded message bytes for transmission.
    fn send(&self, msg: Bytes);

    /// The boot count the remote replica reported at handshake.
    fn boot_count(&self) -> BootCount;
}

/// Snapshot of the currently reachable replicas.
pub type Connections = BTreeMap<ReplicaId, Arc<dyn Connection>>;

/// A registered sender, notified of connectivity changes.
///
/// Callbacks may re-enter the connection manager to deregister the sender
/// (one-shot senders remove themselves once all recipients are served);
/// implementations of [`ConnectionManager`] must tolerate that.
pub trait Sender: Send + Sync {
    /// Invoked once on registration with the current connection snapshot.
    fn connected_replicas(&self, connections: &Connections);

    /// A connection to `replica` was (re-)established.
    fn connection_established(
        &self,
        replica: ReplicaId,
        connection: &Arc<dyn Connection>,
        connections: &Connections,
    );

    /// The connection to `replica` was lost.
    fn connection_lost(&self, replica: ReplicaId, connections: &Connections);
}

/// Registry of senders interested in connectivity changes.
pub trait ConnectionManager: Send + Sync {
    /// Register a sender; `connected_replicas` is invoked with the current
    /// snapshot before this returns.
    fn add_sender(&self, sender: Arc<dyn Sender>);

    /// Deregister a sender; no callbacks are delivered once this returns.
    fn remove_sender_sync(&self, sender: &Arc<dyn Sender>);

    /// Deregister a sender without waiting for in-flight callbacks.
    fn remove_sender_async(&self, sender: &Arc<dyn Sender>);
}
