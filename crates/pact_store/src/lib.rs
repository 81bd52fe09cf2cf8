//! Node crate for the pact replicated key-value store.
//!
//! Provides the durable file WAL, the file-per-key stores, the framed JSON
//! RPC layer with typed clients, and the process assembly used by the
//! `pact-store` binary. The two-phase commit protocol itself lives in
//! `pact_commit`.

pub mod client;
pub mod kv;
pub mod node;
pub mod rpc;
pub mod wal;
