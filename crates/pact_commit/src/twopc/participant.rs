//! Participant side of the two-phase commit protocol.
//!
//! A participant stages put values in a temp store while a transaction is
//! prepared, holds the key locked until the coordinator's decision arrives,
//! and reconciles in-flight transactions with the coordinator on startup.
//! One async mutex serializes all state mutations; it is held across log
//! writes so every operation is ordered into the log before the next
//! begins.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::twopc::types::{
    parse_temp_store_key, temp_store_key, CommitLog, CoordinatorPeer, KeyValueStore, Operation,
    ParticipantDeath, Tx, TxState, FIRST_RESTART_AFTER_SUICIDE_MARKER, KILLED_SELF_MARKER,
};

/// Attempts against the coordinator's status endpoint before a transaction
/// with no reachable outcome is treated as unknown and aborted.
const STATUS_ATTEMPTS: usize = 3;
/// Backoff between status attempts.
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct TxTable {
    txs: HashMap<String, Tx>,
    locked_keys: HashSet<String>,
}

impl TxTable {
    fn set_state(&mut self, tx_id: &str, state: TxState) {
        if let Some(tx) = self.txs.get_mut(tx_id) {
            tx.state = state;
        }
    }
}

pub struct Participant {
    committed: Arc<dyn KeyValueStore>,
    temp: Arc<dyn KeyValueStore>,
    log: Arc<dyn CommitLog>,
    coordinator: Arc<dyn CoordinatorPeer>,
    state: Mutex<TxTable>,
    did_suicide: AtomicBool,
}

impl Participant {
    pub fn new(
        committed: Arc<dyn KeyValueStore>,
        temp: Arc<dyn KeyValueStore>,
        log: Arc<dyn CommitLog>,
        coordinator: Arc<dyn CoordinatorPeer>,
    ) -> Self {
        Self {
            committed,
            temp,
            log,
            coordinator,
            state: Mutex::new(TxTable::default()),
            did_suicide: AtomicBool::new(false),
        }
    }

    /// Read a committed value. Reads do not participate in two-phase commit
    /// and ignore the lock table.
    pub fn get(&self, key: &str) -> Result<String> {
        self.committed.get(key)
    }

    /// Prepare a put: stage the value, lock the key, and vote.
    pub async fn try_put(
        &self,
        key: &str,
        value: &str,
        tx_id: &str,
        death: ParticipantDeath,
    ) -> Result<bool> {
        self.try_mutate(key, tx_id, death, Operation::Put, Some(value))
            .await
    }

    /// Prepare a delete: nothing to stage, the vote rides on the key lock.
    pub async fn try_del(&self, key: &str, tx_id: &str, death: ParticipantDeath) -> Result<bool> {
        self.try_mutate(key, tx_id, death, Operation::Del, None).await
    }

    async fn try_mutate(
        &self,
        key: &str,
        tx_id: &str,
        death: ParticipantDeath,
        op: Operation,
        staged_value: Option<&str>,
    ) -> Result<bool> {
        self.die_if(death, ParticipantDeath::BeforeProcessingMutateRequest)
            .await;

        let mut table = self.state.lock().await;
        table.txs.insert(
            tx_id.to_string(),
            Tx {
                id: tx_id.to_string(),
                key: key.to_string(),
                op,
                state: TxState::Started,
            },
        );

        if table.locked_keys.contains(key) {
            // A conflicting transaction holds the key; refuse rather than
            // block the prepare round.
            warn!(tx = %tx_id, key, %op, "key locked by another transaction, aborting");
            table.set_state(tx_id, TxState::Aborted);
            self.log.write_state(tx_id, TxState::Aborted).await?;
            return Ok(false);
        }
        table.locked_keys.insert(key.to_string());

        if let Some(value) = staged_value {
            if let Err(err) = self.temp.put(&temp_store_key(tx_id, key), value) {
                warn!(tx = %tx_id, key, error = %err, "unable to stage value, aborting");
                table.set_state(tx_id, TxState::Aborted);
                self.log.write_state(tx_id, TxState::Aborted).await?;
                table.locked_keys.remove(key);
                return Ok(false);
            }
        }

        table.set_state(tx_id, TxState::Prepared);
        self.log.write_op(tx_id, TxState::Prepared, op, key).await?;
        drop(table);

        self.die_if(death, ParticipantDeath::AfterLoggingPrepared)
            .await;
        Ok(true)
    }

    /// Apply the coordinator's commit decision.
    ///
    /// An unknown transaction (a duplicate commit or an abort race) is
    /// reported as `false` without failing the call; a storage failure is
    /// surfaced as an error so the coordinator's retry loop re-drives it.
    pub async fn commit(&self, tx_id: &str, death: ParticipantDeath) -> Result<bool> {
        self.die_if(death, ParticipantDeath::BeforeProcessingCommit)
            .await;

        let mut table = self.state.lock().await;
        let Some(tx) = table.txs.get(tx_id).cloned() else {
            warn!(tx = %tx_id, "commit for unknown transaction");
            return Ok(false);
        };

        match tx.state {
            TxState::Prepared => {
                if !table.locked_keys.contains(&tx.key) {
                    warn!(tx = %tx_id, key = %tx.key, "prepared transaction without a key lock");
                }
                self.commit_tx(&mut table, tx_id, tx.op, &tx.key, death)
                    .await?;
            }
            state => info!(tx = %tx_id, %state, "commit for transaction already settled"),
        }
        Ok(true)
    }

    /// Apply a commit: move staged state into the committed store, make the
    /// outcome durable, then drop the staged value. The `Committed` record
    /// is flushed before the temp entry is deleted so a crash between the
    /// two replays the commit instead of losing the put.
    async fn commit_tx(
        &self,
        table: &mut TxTable,
        tx_id: &str,
        op: Operation,
        key: &str,
        death: ParticipantDeath,
    ) -> Result<()> {
        table.locked_keys.remove(key);

        match op {
            Operation::Put => {
                let staged = self
                    .temp
                    .get(&temp_store_key(tx_id, key))
                    .with_context(|| format!("no staged value for transaction {tx_id} key {key}"))?;
                self.committed
                    .put(key, &staged)
                    .with_context(|| format!("unable to commit put for transaction {tx_id} key {key}"))?;
            }
            Operation::Del => {
                self.committed
                    .del(key)
                    .with_context(|| format!("unable to commit del for transaction {tx_id} key {key}"))?;
            }
            other => anyhow::bail!("cannot commit transaction {tx_id} with a {other} operation"),
        }

        self.log.write_state(tx_id, TxState::Committed).await?;
        table.txs.remove(tx_id);

        if op == Operation::Put {
            let dropped = self.temp.del(&temp_store_key(tx_id, key));
            self.die_if(death, ParticipantDeath::AfterDeletingFromTempStore)
                .await;
            if let Err(err) = dropped {
                warn!(tx = %tx_id, key, error = %err, "unable to drop staged value after commit");
            }
        }

        self.die_if(death, ParticipantDeath::AfterLoggingCommitted)
            .await;
        Ok(())
    }

    /// Apply the coordinator's abort decision. Unknown transactions are
    /// anomalies but still acknowledged.
    pub async fn abort(&self, tx_id: &str) -> Result<bool> {
        let mut table = self.state.lock().await;
        match table.txs.get(tx_id).cloned() {
            None => warn!(tx = %tx_id, "abort for unknown transaction"),
            Some(tx) => match tx.state {
                TxState::Prepared => {
                    if !table.locked_keys.contains(&tx.key) {
                        warn!(tx = %tx_id, key = %tx.key, "prepared transaction without a key lock");
                    }
                    self.abort_tx(&mut table, tx_id, tx.op, &tx.key).await?;
                }
                state => info!(tx = %tx_id, %state, "abort for transaction already settled"),
            },
        }
        Ok(true)
    }

    /// Undo a prepared transaction: release the key, discard any staged
    /// value, and make the abort durable.
    async fn abort_tx(
        &self,
        table: &mut TxTable,
        tx_id: &str,
        op: Operation,
        key: &str,
    ) -> Result<()> {
        table.locked_keys.remove(key);

        match op {
            // `Recovery` cannot name the original operation; discarding the
            // staged value is harmless when none was written.
            Operation::Put | Operation::Recovery => {
                if let Err(err) = self.temp.del(&temp_store_key(tx_id, key)) {
                    warn!(tx = %tx_id, key, error = %err, "unable to drop staged value during abort");
                }
            }
            Operation::Del | Operation::None => {}
        }

        self.log.write_state(tx_id, TxState::Aborted).await?;
        table.txs.remove(tx_id);
        Ok(())
    }

    /// Replay the log, resolve prepared transactions with the coordinator,
    /// and sweep staged values with no live owner. Runs before the
    /// participant serves requests.
    pub async fn recover(&self) -> Result<()> {
        let records = self.log.read_all()?;

        let mut did_suicide = false;
        let mut table = self.state.lock().await;
        for record in records {
            match record.tx_id.as_str() {
                KILLED_SELF_MARKER => {
                    did_suicide = true;
                    continue;
                }
                FIRST_RESTART_AFTER_SUICIDE_MARKER => {
                    did_suicide = false;
                    continue;
                }
                _ => {}
            }

            let mut state = record.state;
            if state == TxState::Prepared {
                state = match self.fetch_status(&record.tx_id).await {
                    TxState::Committed => {
                        info!(tx = %record.tx_id, key = %record.key, "committing transaction during recovery");
                        // Replay is best-effort: a missing staged value means
                        // the commit already took effect before the crash.
                        if let Err(err) = self
                            .commit_tx(
                                &mut table,
                                &record.tx_id,
                                record.op,
                                &record.key,
                                ParticipantDeath::None,
                            )
                            .await
                        {
                            info!(tx = %record.tx_id, error = %err, "commit replay skipped");
                        }
                        TxState::Committed
                    }
                    // `Started` means the coordinator never reached a commit
                    // point; its own recovery aborts such transactions.
                    TxState::Aborted | TxState::None | TxState::Started | TxState::Prepared => {
                        info!(tx = %record.tx_id, key = %record.key, "aborting transaction during recovery");
                        self.abort_tx(&mut table, &record.tx_id, record.op, &record.key)
                            .await?;
                        TxState::Aborted
                    }
                };
            }

            if matches!(state, TxState::Committed | TxState::Aborted) {
                table.txs.insert(
                    record.tx_id.clone(),
                    Tx {
                        id: record.tx_id.clone(),
                        key: record.key.clone(),
                        op: record.op,
                        state,
                    },
                );
            }
        }

        self.sweep_temp_store(&mut table)?;

        if did_suicide {
            self.log
                .write_special(FIRST_RESTART_AFTER_SUICIDE_MARKER)
                .await?;
        }
        self.did_suicide.store(did_suicide, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the coordinator for a transaction's outcome, tolerating a briefly
    /// unreachable coordinator. Once the attempts are exhausted the
    /// transaction is treated as having no recorded state.
    async fn fetch_status(&self, tx_id: &str) -> TxState {
        for attempt in 1..=STATUS_ATTEMPTS {
            match self.coordinator.status(tx_id).await {
                Ok(state) => return state,
                Err(err) => {
                    warn!(tx = %tx_id, attempt, error = %err, "coordinator status probe failed");
                    if attempt < STATUS_ATTEMPTS {
                        tokio::time::sleep(STATUS_RETRY_DELAY).await;
                    }
                }
            }
        }
        warn!(tx = %tx_id, "coordinator unreachable, treating transaction as unknown");
        TxState::None
    }

    /// Drop staged values whose transaction is gone or no longer prepared.
    fn sweep_temp_store(&self, table: &mut TxTable) -> Result<()> {
        for composite in self.temp.list()? {
            let keep = parse_temp_store_key(&composite)
                .and_then(|(tx_id, _)| table.txs.get(tx_id))
                .map(|tx| tx.state == TxState::Prepared)
                .unwrap_or(false);
            if !keep {
                info!(key = %composite, "sweeping staged value");
                self.temp.del(&composite)?;
            }
        }
        Ok(())
    }

    /// Crash-injection point: exit after durably marking the log so the next
    /// recovery knows the crash was deliberate. Disarmed for the first run
    /// after an injected crash.
    async fn die_if(&self, actual: ParticipantDeath, expected: ParticipantDeath) {
        if actual == expected && !self.did_suicide.load(Ordering::Relaxed) {
            warn!(point = ?expected, "killing self as requested");
            if let Err(err) = self.log.write_special(KILLED_SELF_MARKER).await {
                error!(error = %err, "failed to log the crash marker");
            }
            std::process::exit(1);
        }
    }
}
