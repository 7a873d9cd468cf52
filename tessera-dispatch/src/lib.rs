//! Single-consumer work queues.
//!
//! An [`Executor`] is an unbounded FIFO queue of deferred computations
//! drained by exactly one worker task. Any producer may enqueue; works run
//! strictly in enqueue order and never in parallel with each other, so all
//! state owned by a component that only mutates itself from inside enqueued
//! works is effectively serialized without locks being contended.
//!
//! A [`Dispatcher`] holds a fixed array of executors and shards work across
//! them by a stable key, so everything concerning one entity (for example
//! one transaction) lands on the same executor.

#![warn(clippy::pedantic)]

mod executor;

pub use executor::{Dispatcher, Executor};
