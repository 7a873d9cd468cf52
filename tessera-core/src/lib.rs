//! Tessera core - shared types for the transaction coordination core
//!
//! This crate provides the common vocabulary used by the submitter
//! (`tessera-client`) and the acceptor side (`tessera-paxos`):
//! identifiers, the topology snapshot, client and server transaction
//! records, outcomes, and the wire message enum.

#![warn(clippy::pedantic)]

pub mod ids;
pub mod message;
pub mod outcome;
pub mod topology;
pub mod txn;

pub use ids::{BootCount, Positions, ReplicaId, TxnId, VarId};
pub use message::Message;
pub use outcome::{Abort, Outcome, Update};
pub use topology::{RootVar, Topology};
pub use txn::{
    Action, ActionKind, Allocation, ClientAction, ClientActionKind, ClientTxn, Txn, VarRef,
};
