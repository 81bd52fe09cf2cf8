//! Node assembly: wiring stores, logs, and RPC services into runnable
//! coordinator and participant processes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::info;

use pact_commit::twopc::{
    CommitLog, Coordinator, CoordinatorDeath, CoordinatorPeer, KeyValueStore, Operation,
    Participant, ParticipantPeer,
};

use crate::client::{CoordinatorClient, ParticipantClient};
use crate::kv::FileStore;
use crate::rpc::{
    self, CoordinatorRequest, CoordinatorResponse, ParticipantRequest, ParticipantResponse,
    Service,
};
use crate::wal::FileWal;

/// Default coordinator port.
pub const MASTER_PORT: u16 = 7170;
/// Default first participant port; participant `i` listens on start + i.
pub const REPLICA_PORT_START: u16 = 7171;

/// Network and directory layout shared by both roles.
#[derive(Clone, Debug)]
pub struct Topology {
    pub host: String,
    pub master_port: u16,
    pub replica_port_start: u16,
    pub base_dir: PathBuf,
}

impl Topology {
    pub fn master_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.master_port)
            .parse()
            .context("master address")
    }

    pub fn replica_addr(&self, index: usize) -> Result<SocketAddr> {
        let offset = u16::try_from(index).context("replica index out of range")?;
        let port = self
            .replica_port_start
            .checked_add(offset)
            .context("replica port out of range")?;
        format!("{}:{}", self.host, port)
            .parse()
            .context("replica address")
    }

    fn master_log(&self) -> PathBuf {
        self.base_dir.join("logs").join("master.txt")
    }

    fn replica_log(&self, index: usize) -> PathBuf {
        self.base_dir.join("logs").join(format!("replica{index}.txt"))
    }

    fn replica_data(&self, index: usize, kind: &str) -> PathBuf {
        self.base_dir
            .join("data")
            .join(format!("replica{index}"))
            .join(kind)
    }
}

struct CoordinatorService {
    coordinator: Arc<Coordinator>,
}

#[async_trait]
impl Service for CoordinatorService {
    type Request = CoordinatorRequest;
    type Response = CoordinatorResponse;

    async fn handle(&self, request: CoordinatorRequest) -> Result<CoordinatorResponse> {
        match request {
            CoordinatorRequest::Get { key } => Ok(CoordinatorResponse::Value(
                self.coordinator.get(&key, None).await?,
            )),
            CoordinatorRequest::GetFrom { key, participant } => Ok(CoordinatorResponse::Value(
                self.coordinator.get(&key, Some(participant)).await?,
            )),
            CoordinatorRequest::Put { key, value } => {
                self.coordinator
                    .mutate(
                        Operation::Put,
                        &key,
                        Some(&value),
                        CoordinatorDeath::None,
                        &[],
                    )
                    .await?;
                Ok(CoordinatorResponse::Done)
            }
            CoordinatorRequest::Del { key } => {
                self.coordinator
                    .mutate(Operation::Del, &key, None, CoordinatorDeath::None, &[])
                    .await?;
                Ok(CoordinatorResponse::Done)
            }
            CoordinatorRequest::PutTest {
                key,
                value,
                death,
                participant_deaths,
            } => {
                self.coordinator
                    .mutate(
                        Operation::Put,
                        &key,
                        Some(&value),
                        death,
                        &participant_deaths,
                    )
                    .await?;
                Ok(CoordinatorResponse::Done)
            }
            CoordinatorRequest::DelTest {
                key,
                death,
                participant_deaths,
            } => {
                self.coordinator
                    .mutate(Operation::Del, &key, None, death, &participant_deaths)
                    .await?;
                Ok(CoordinatorResponse::Done)
            }
            CoordinatorRequest::Status { tx_id } => Ok(CoordinatorResponse::Status(
                self.coordinator.status(&tx_id),
            )),
            CoordinatorRequest::Ping { key } => Ok(CoordinatorResponse::Pong(key)),
        }
    }
}

struct ParticipantService {
    participant: Arc<Participant>,
}

#[async_trait]
impl Service for ParticipantService {
    type Request = ParticipantRequest;
    type Response = ParticipantResponse;

    async fn handle(&self, request: ParticipantRequest) -> Result<ParticipantResponse> {
        match request {
            ParticipantRequest::Get { key } => {
                Ok(ParticipantResponse::Value(self.participant.get(&key)?))
            }
            ParticipantRequest::TryPut {
                key,
                value,
                tx_id,
                death,
            } => Ok(ParticipantResponse::Ack {
                success: self.participant.try_put(&key, &value, &tx_id, death).await?,
            }),
            ParticipantRequest::TryDel { key, tx_id, death } => Ok(ParticipantResponse::Ack {
                success: self.participant.try_del(&key, &tx_id, death).await?,
            }),
            ParticipantRequest::Commit { tx_id, death } => Ok(ParticipantResponse::Ack {
                success: self.participant.commit(&tx_id, death).await?,
            }),
            ParticipantRequest::Abort { tx_id } => Ok(ParticipantResponse::Ack {
                success: self.participant.abort(&tx_id).await?,
            }),
            ParticipantRequest::Ping { key } => Ok(ParticipantResponse::Pong(key)),
        }
    }
}

/// Run the coordinator: recover from the log, then serve until killed.
pub async fn run_master(topology: Topology, replica_count: usize) -> Result<()> {
    anyhow::ensure!(replica_count > 0, "replica count must be greater than zero");

    let log = Arc::new(FileWal::open(topology.master_log())?) as Arc<dyn CommitLog>;
    let mut participants: Vec<Arc<dyn ParticipantPeer>> = Vec::with_capacity(replica_count);
    for index in 0..replica_count {
        participants.push(Arc::new(ParticipantClient::new(
            topology.replica_addr(index)?,
        )));
    }
    let coordinator = Arc::new(Coordinator::new(participants, log)?);

    coordinator.recover().await.context("master recovery")?;

    let addr = topology.master_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, replica_count, "master listening");
    rpc::serve(listener, Arc::new(CoordinatorService { coordinator })).await
}

/// Run participant `index`: recover, then serve until killed.
pub async fn run_replica(topology: Topology, index: usize) -> Result<()> {
    let log = Arc::new(FileWal::open(topology.replica_log(index))?) as Arc<dyn CommitLog>;
    let committed = Arc::new(FileStore::open(topology.replica_data(index, "committed"))?)
        as Arc<dyn KeyValueStore>;
    let temp = Arc::new(FileStore::open(topology.replica_data(index, "temp"))?)
        as Arc<dyn KeyValueStore>;
    let coordinator =
        Arc::new(CoordinatorClient::new(topology.master_addr()?)) as Arc<dyn CoordinatorPeer>;
    let participant = Arc::new(Participant::new(committed, temp, log, coordinator));

    participant.recover().await.context("replica recovery")?;

    let addr = topology.replica_addr(index)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, index, "replica listening");
    rpc::serve(listener, Arc::new(ParticipantService { participant })).await
}
