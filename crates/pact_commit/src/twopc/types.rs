//! Shared types for the two-phase commit engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the coordinator, the participant, and the transport/client
//! layers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque transaction identifier, unique across all live transactions.
pub type TxId = String;

/// Log marker recording a deliberate crash-injection exit.
pub const KILLED_SELF_MARKER: &str = "::justkilledself::";
/// Log marker recording the first restart after an injected crash.
pub const FIRST_RESTART_AFTER_SUICIDE_MARKER: &str = "::firstrestartaftersuicide::";

/// Separator joining a transaction id and a key into a temp-store key.
/// Must never appear in a transaction id; generated ids are numeric.
const TEMP_KEY_SEPARATOR: &str = "__";

/// Lifecycle state of a transaction. `Prepared` exists only on participants;
/// the coordinator moves between `Started`, `Committed`, and `Aborted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    None,
    Started,
    Prepared,
    Committed,
    Aborted,
}

impl TxState {
    pub fn as_str(self) -> &'static str {
        match self {
            TxState::None => "none",
            TxState::Started => "started",
            TxState::Prepared => "prepared",
            TxState::Committed => "committed",
            TxState::Aborted => "aborted",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "none" => Some(TxState::None),
            "started" => Some(TxState::Started),
            "prepared" => Some(TxState::Prepared),
            "committed" => Some(TxState::Committed),
            "aborted" => Some(TxState::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation carried by a transaction. `Recovery` is a sentinel for
/// reconciliation paths that reconstruct a commit or abort after a crash
/// without naming the original operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    None,
    Put,
    Del,
    Recovery,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::None => "none",
            Operation::Put => "put",
            Operation::Del => "del",
            Operation::Recovery => "recovery",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "none" => Some(Operation::None),
            "put" => Some(Operation::Put),
            "del" => Some(Operation::Del),
            "recovery" => Some(Operation::Recovery),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Participant-local transaction record, created when a prepare request
/// arrives and dropped once the terminal transition is durably logged.
#[derive(Clone, Debug)]
pub struct Tx {
    pub id: TxId,
    pub key: String,
    pub op: Operation,
    pub state: TxState,
}

/// One durable log row: `(tx_id, state, op, key)`. Marker rows use a
/// reserved tx id with `TxState::None` and `Operation::None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub tx_id: TxId,
    pub state: TxState,
    pub op: Operation,
    pub key: String,
}

/// Crash-injection points for the coordinator process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorDeath {
    None,
    BeforeLoggingCommitted,
    AfterLoggingCommitted,
}

/// Crash-injection points for a participant process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantDeath {
    None,
    BeforeProcessingMutateRequest,
    AfterLoggingPrepared,
    BeforeProcessingCommit,
    AfterDeletingFromTempStore,
    AfterLoggingCommitted,
}

/// Error returned to clients when the prepare round fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxAborted;

impl fmt::Display for TxAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transaction aborted")
    }
}

impl std::error::Error for TxAborted {}

/// Durable transaction log consumed by both roles.
///
/// Writes block until the record is on stable storage. `read_all` returns
/// the full log in append order; a missing file reads as empty.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn write_op(
        &self,
        tx_id: &str,
        state: TxState,
        op: Operation,
        key: &str,
    ) -> anyhow::Result<()>;

    async fn write_state(&self, tx_id: &str, state: TxState) -> anyhow::Result<()> {
        self.write_op(tx_id, state, Operation::None, "").await
    }

    async fn write_special(&self, marker: &str) -> anyhow::Result<()> {
        self.write_op(marker, TxState::None, Operation::None, "").await
    }

    fn read_all(&self) -> anyhow::Result<Vec<LogRecord>>;
}

/// Blob store keyed by strings; both the committed and the temp store use
/// this interface.
pub trait KeyValueStore: Send + Sync + 'static {
    fn put(&self, key: &str, value: &str) -> anyhow::Result<()>;
    /// Fails when the key is absent.
    fn get(&self, key: &str) -> anyhow::Result<String>;
    /// Idempotent delete.
    fn del(&self, key: &str) -> anyhow::Result<()>;
    fn list(&self) -> anyhow::Result<Vec<String>>;
}

/// Coordinator-side handle to one participant.
#[async_trait]
pub trait ParticipantPeer: Send + Sync + 'static {
    async fn try_put(
        &self,
        key: &str,
        value: &str,
        tx_id: &str,
        death: ParticipantDeath,
    ) -> anyhow::Result<bool>;

    async fn try_del(&self, key: &str, tx_id: &str, death: ParticipantDeath)
        -> anyhow::Result<bool>;

    async fn commit(&self, tx_id: &str, death: ParticipantDeath) -> anyhow::Result<bool>;

    async fn abort(&self, tx_id: &str) -> anyhow::Result<bool>;

    async fn get(&self, key: &str) -> anyhow::Result<String>;
}

/// Participant-side handle to the coordinator, used to resolve prepared
/// transactions during recovery.
#[async_trait]
pub trait CoordinatorPeer: Send + Sync + 'static {
    async fn status(&self, tx_id: &str) -> anyhow::Result<TxState>;
}

/// Compose the temp-store key for a staged put.
pub fn temp_store_key(tx_id: &str, key: &str) -> String {
    format!("{tx_id}{TEMP_KEY_SEPARATOR}{key}")
}

/// Split a temp-store key back into `(tx_id, key)`.
pub fn parse_temp_store_key(composite: &str) -> Option<(&str, &str)> {
    composite.split_once(TEMP_KEY_SEPARATOR)
}

/// Generate a transaction id: a nanosecond wall-clock stamp raised through a
/// process-local high-water mark, so ids are strictly increasing within a
/// process and unique across restarts under a forward-moving clock.
pub fn next_tx_id() -> TxId {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0);

    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(observed) => prev = observed,
        }
    }
}
