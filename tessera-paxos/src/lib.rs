//! Tessera acceptor side.
//!
//! This crate implements the Paxos acceptor role for the transaction
//! coordination core:
//!
//! - [`BallotAccumulator`]: pure per-transaction vote accumulation, shared
//!   between the live state machine and reconstruction from disk.
//! - [`Acceptor`](acceptor): the four-state machine
//!   (ReceiveBallots → WriteToDisk → AwaitLocallyComplete → DeleteFromDisk),
//!   expressed as pure transitions that emit [`Effect`](acceptor::Effect)s.
//! - [`AcceptorManager`] / [`AcceptorDispatcher`]: the async shell that owns
//!   acceptors on an executor, drives disk futures and sender registration.
//! - [`OutcomeAccumulator`]: submitter-side collection of acceptor outcomes.
//! - Sender implementations and the external-collaborator traits
//!   ([`ConnectionManager`], [`Disk`]).

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod ballot;
pub mod disk;
pub mod manager;
pub mod network;
pub mod outcomes;
pub mod sender;

pub use acceptor::DurableAcceptorState;
pub use ballot::{Ballot, BallotAccumulator, InstanceRecord, Vote};
pub use disk::{Disk, DiskCompletion, DiskError, DiskFuture, FjallDisk, RwHandle, RwWork, Table};
pub use manager::{AcceptorDispatcher, AcceptorManager};
pub use network::{Connection, ConnectionManager, Connections, Sender};
pub use outcomes::OutcomeAccumulator;
pub use sender::{RepeatingSender, TwoBSender, send_one_shot};
