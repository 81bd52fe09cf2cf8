//! Two-phase commit protocol crate.
//!
//! This crate provides the coordinator and participant state machines used
//! by pact_store. The API surface is intentionally small: higher layers
//! supply a `CommitLog`, a pair of `KeyValueStore`s, and RPC peers, then
//! drive transactions through `Coordinator` and `Participant`.

pub mod twopc;
