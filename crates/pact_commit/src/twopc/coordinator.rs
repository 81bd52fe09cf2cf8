//! Coordinator side of the two-phase commit protocol.
//!
//! The coordinator owns the commit decision: it logs `Started`, drives the
//! prepare round across every participant, and once `Committed` is durable
//! it retries the commit fan-out until every participant has applied it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::twopc::types::{
    next_tx_id, CommitLog, CoordinatorDeath, Operation, ParticipantDeath, ParticipantPeer,
    TxAborted, TxState, FIRST_RESTART_AFTER_SUICIDE_MARKER, KILLED_SELF_MARKER,
};

/// Backoff between commit fan-out retries.
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Coordinator {
    participants: Vec<Arc<dyn ParticipantPeer>>,
    log: Arc<dyn CommitLog>,
    txs: Mutex<HashMap<String, TxState>>,
    did_suicide: AtomicBool,
}

impl Coordinator {
    pub fn new(participants: Vec<Arc<dyn ParticipantPeer>>, log: Arc<dyn CommitLog>) -> Result<Self> {
        anyhow::ensure!(
            !participants.is_empty(),
            "coordinator requires at least one participant"
        );
        Ok(Self {
            participants,
            log,
            txs: Mutex::new(HashMap::new()),
            did_suicide: AtomicBool::new(false),
        })
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    fn tx_table(&self) -> MutexGuard<'_, HashMap<String, TxState>> {
        self.txs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive one mutation through the full two-phase commit state machine.
    ///
    /// Returns `TxAborted` when any participant refuses or fails the prepare
    /// round. Once `Committed` is durably logged the commit fan-out retries
    /// forever and the mutation is reported successful.
    pub async fn mutate(
        &self,
        op: Operation,
        key: &str,
        value: Option<&str>,
        death: CoordinatorDeath,
        participant_deaths: &[ParticipantDeath],
    ) -> Result<()> {
        let tx_id = next_tx_id();
        self.log.write_state(&tx_id, TxState::Started).await?;
        self.tx_table().insert(tx_id.clone(), TxState::Started);
        info!(tx = %tx_id, key, %op, "asking participants to prepare");

        // Any refusal or transport failure during prepare is a vote to
        // abort. The channel is buffered to the participant count so voters
        // never block on the barrier.
        let (abort_tx, mut abort_rx) = mpsc::channel::<usize>(self.participants.len());
        let tx = tx_id.as_str();
        let mut prepares: FuturesUnordered<_> = self
            .participants
            .iter()
            .enumerate()
            .map(|(index, peer)| {
                let abort_tx = abort_tx.clone();
                let peer_death = participant_death_for(participant_deaths, index);
                async move {
                    let vote = match op {
                        Operation::Put => match value {
                            Some(value) => peer.try_put(key, value, tx, peer_death).await,
                            None => Err(anyhow::anyhow!("put without a value")),
                        },
                        Operation::Del => peer.try_del(key, tx, peer_death).await,
                        other => Err(anyhow::anyhow!("cannot prepare a {other} operation")),
                    };
                    match vote {
                        Ok(true) => {}
                        Ok(false) => {
                            let _ = abort_tx.try_send(index);
                        }
                        Err(err) => {
                            warn!(participant = index, tx, error = %err, "prepare failed");
                            let _ = abort_tx.try_send(index);
                        }
                    }
                }
            })
            .collect();
        while prepares.next().await.is_some() {}
        drop(abort_tx);

        if abort_rx.try_recv().is_ok() {
            info!(tx = %tx_id, key, "asking participants to abort");
            self.log.write_state(&tx_id, TxState::Aborted).await?;
            self.tx_table().insert(tx_id.clone(), TxState::Aborted);
            self.send_abort(&tx_id).await;
            return Err(TxAborted.into());
        }

        self.die_if(death, CoordinatorDeath::BeforeLoggingCommitted)
            .await;
        // The commit point: once this record is durable the outcome binds
        // every participant.
        self.log.write_state(&tx_id, TxState::Committed).await?;
        self.die_if(death, CoordinatorDeath::AfterLoggingCommitted)
            .await;
        self.tx_table().insert(tx_id.clone(), TxState::Committed);

        info!(tx = %tx_id, key, "asking participants to commit");
        self.send_and_wait_for_commit(&tx_id, participant_deaths)
            .await;
        Ok(())
    }

    /// Best-effort abort fan-out. Failures only log: a participant that
    /// misses the abort reconciles through recovery.
    async fn send_abort(&self, tx_id: &str) {
        let mut aborts: FuturesUnordered<_> = self
            .participants
            .iter()
            .enumerate()
            .map(|(index, peer)| async move {
                if let Err(err) = peer.abort(tx_id).await {
                    warn!(participant = index, tx = %tx_id, error = %err, "abort fan-out failed");
                }
            })
            .collect();
        while aborts.next().await.is_some() {}
    }

    /// Commit fan-out with unbounded per-participant retry. Once the commit
    /// point has passed the coordinator must not give up.
    async fn send_and_wait_for_commit(
        &self,
        tx_id: &str,
        participant_deaths: &[ParticipantDeath],
    ) {
        let mut commits: FuturesUnordered<_> = self
            .participants
            .iter()
            .enumerate()
            .map(|(index, peer)| {
                let peer_death = participant_death_for(participant_deaths, index);
                async move {
                    loop {
                        match peer.commit(tx_id, peer_death).await {
                            Ok(_) => break,
                            Err(err) => {
                                warn!(
                                    participant = index,
                                    tx = %tx_id,
                                    error = %err,
                                    "commit fan-out failed, retrying"
                                );
                                tokio::time::sleep(COMMIT_RETRY_DELAY).await;
                            }
                        }
                    }
                }
            })
            .collect();
        while commits.next().await.is_some() {}
    }

    /// The coordinator's view of a transaction; `None` when it has no
    /// record. Participants call this to resolve prepared transactions.
    pub fn status(&self, tx_id: &str) -> TxState {
        self.tx_table()
            .get(tx_id)
            .copied()
            .unwrap_or(TxState::None)
    }

    /// Read a key from one participant. All participants hold identical
    /// committed state, so an unspecified participant is chosen at random.
    pub async fn get(&self, key: &str, participant: Option<usize>) -> Result<String> {
        let index = match participant {
            Some(index) => {
                anyhow::ensure!(
                    index < self.participants.len(),
                    "participant {index} out of range"
                );
                index
            }
            None => rand::thread_rng().gen_range(0..self.participants.len()),
        };
        self.participants[index].get(key).await
    }

    /// Rebuild the tx table from the log and re-drive unfinished outcomes.
    ///
    /// `Started` at recovery time means the crash happened before the commit
    /// decision was logged; participants holding prepared state abort once
    /// they learn the outcome.
    pub async fn recover(&self) -> Result<()> {
        let records = self.log.read_all()?;

        let mut did_suicide = false;
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
            self.tx_table().insert(record.tx_id, record.state);
        }

        let txs: Vec<(String, TxState)> = self
            .tx_table()
            .iter()
            .map(|(tx_id, state)| (tx_id.clone(), *state))
            .collect();
        for (tx_id, state) in txs {
            match state {
                TxState::Started | TxState::Aborted => {
                    info!(tx = %tx_id, "aborting transaction during recovery");
                    self.send_abort(&tx_id).await;
                }
                TxState::Committed => {
                    info!(tx = %tx_id, "committing transaction during recovery");
                    self.send_and_wait_for_commit(&tx_id, &[]).await;
                }
                TxState::Prepared | TxState::None => {
                    warn!(tx = %tx_id, %state, "unexpected state in coordinator log");
                }
            }
        }

        if did_suicide {
            self.log
                .write_special(FIRST_RESTART_AFTER_SUICIDE_MARKER)
                .await?;
        }
        self.did_suicide.store(did_suicide, Ordering::Relaxed);
        Ok(())
    }

    /// Crash-injection point: exit after durably marking the log so the next
    /// recovery knows the crash was deliberate. Disarmed for the first run
    /// after an injected crash.
    async fn die_if(&self, actual: CoordinatorDeath, expected: CoordinatorDeath) {
        if actual == expected && !self.did_suicide.load(Ordering::Relaxed) {
            warn!(point = ?expected, "killing self as requested");
            if let Err(err) = self.log.write_special(KILLED_SELF_MARKER).await {
                error!(error = %err, "failed to log the crash marker");
            }
            std::process::exit(1);
        }
    }
}

/// Death point for participant `index`; missing entries mean no injection.
fn participant_death_for(deaths: &[ParticipantDeath], index: usize) -> ParticipantDeath {
    deaths.get(index).copied().unwrap_or(ParticipantDeath::None)
}
