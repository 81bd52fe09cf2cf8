pub mod coordinator;
pub mod participant;
pub mod types;

pub use coordinator::Coordinator;
pub use participant::Participant;
pub use types::{
    next_tx_id, parse_temp_store_key, temp_store_key, CommitLog, CoordinatorDeath,
    CoordinatorPeer, KeyValueStore, LogRecord, Operation, ParticipantDeath, ParticipantPeer, Tx,
    TxAborted, TxId, TxState, FIRST_RESTART_AFTER_SUICIDE_MARKER, KILLED_SELF_MARKER,
};
