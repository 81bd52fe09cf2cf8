//! Typed clients for the coordinator and participant services.
//!
//! `ParticipantClient` is the coordinator's handle to one replica;
//! `CoordinatorClient` backs both the CLI and the participant's
//! recovery-time status probes.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use pact_commit::twopc::{
    CoordinatorDeath, CoordinatorPeer, ParticipantDeath, ParticipantPeer, TxState,
};

use crate::rpc::{
    CoordinatorRequest, CoordinatorResponse, ParticipantRequest, ParticipantResponse, RpcClient,
};

fn unexpected(call: &str, response: &impl std::fmt::Debug) -> anyhow::Error {
    anyhow::anyhow!("unexpected {call} response: {response:?}")
}

/// Client for the coordinator surface.
pub struct CoordinatorClient {
    rpc: RpcClient,
}

impl CoordinatorClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            rpc: RpcClient::new(addr),
        }
    }

    pub async fn get(&self, key: &str) -> Result<String> {
        match self
            .rpc
            .call(&CoordinatorRequest::Get {
                key: key.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Value(value) => Ok(value),
            other => Err(unexpected("get", &other)),
        }
    }

    /// Test variant of `get` that reads from one specific participant.
    pub async fn get_from(&self, key: &str, participant: usize) -> Result<String> {
        match self
            .rpc
            .call(&CoordinatorRequest::GetFrom {
                key: key.to_string(),
                participant,
            })
            .await?
        {
            CoordinatorResponse::Value(value) => Ok(value),
            other => Err(unexpected("get_from", &other)),
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        match self
            .rpc
            .call(&CoordinatorRequest::Put {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Done => Ok(()),
            other => Err(unexpected("put", &other)),
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        match self
            .rpc
            .call(&CoordinatorRequest::Del {
                key: key.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Done => Ok(()),
            other => Err(unexpected("del", &other)),
        }
    }

    /// Test variant of `put` carrying crash-injection points.
    pub async fn put_test(
        &self,
        key: &str,
        value: &str,
        death: CoordinatorDeath,
        participant_deaths: Vec<ParticipantDeath>,
    ) -> Result<()> {
        match self
            .rpc
            .call(&CoordinatorRequest::PutTest {
                key: key.to_string(),
                value: value.to_string(),
                death,
                participant_deaths,
            })
            .await?
        {
            CoordinatorResponse::Done => Ok(()),
            other => Err(unexpected("put_test", &other)),
        }
    }

    /// Test variant of `del` carrying crash-injection points.
    pub async fn del_test(
        &self,
        key: &str,
        death: CoordinatorDeath,
        participant_deaths: Vec<ParticipantDeath>,
    ) -> Result<()> {
        match self
            .rpc
            .call(&CoordinatorRequest::DelTest {
                key: key.to_string(),
                death,
                participant_deaths,
            })
            .await?
        {
            CoordinatorResponse::Done => Ok(()),
            other => Err(unexpected("del_test", &other)),
        }
    }

    pub async fn status(&self, tx_id: &str) -> Result<TxState> {
        match self
            .rpc
            .call(&CoordinatorRequest::Status {
                tx_id: tx_id.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Status(state) => Ok(state),
            other => Err(unexpected("status", &other)),
        }
    }

    pub async fn ping(&self, key: &str) -> Result<String> {
        match self
            .rpc
            .call(&CoordinatorRequest::Ping {
                key: key.to_string(),
            })
            .await?
        {
            CoordinatorResponse::Pong(key) => Ok(key),
            other => Err(unexpected("ping", &other)),
        }
    }
}

#[async_trait]
impl CoordinatorPeer for CoordinatorClient {
    async fn status(&self, tx_id: &str) -> Result<TxState> {
        CoordinatorClient::status(self, tx_id).await
    }
}

/// Client for one participant's surface.
pub struct ParticipantClient {
    rpc: RpcClient,
}

impl ParticipantClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            rpc: RpcClient::new(addr),
        }
    }

    pub async fn ping(&self, key: &str) -> Result<String> {
        match self
            .rpc
            .call(&ParticipantRequest::Ping {
                key: key.to_string(),
            })
            .await?
        {
            ParticipantResponse::Pong(key) => Ok(key),
            other => Err(unexpected("ping", &other)),
        }
    }

    async fn ack(&self, call: &str, request: &ParticipantRequest) -> Result<bool> {
        match self.rpc.call(request).await? {
            ParticipantResponse::Ack { success } => Ok(success),
            other => Err(unexpected(call, &other)),
        }
    }
}

#[async_trait]
impl ParticipantPeer for ParticipantClient {
    async fn try_put(
        &self,
        key: &str,
        value: &str,
        tx_id: &str,
        death: ParticipantDeath,
    ) -> Result<bool> {
        self.ack(
            "try_put",
            &ParticipantRequest::TryPut {
                key: key.to_string(),
                value: value.to_string(),
                tx_id: tx_id.to_string(),
                death,
            },
        )
        .await
    }

    async fn try_del(&self, key: &str, tx_id: &str, death: ParticipantDeath) -> Result<bool> {
        self.ack(
            "try_del",
            &ParticipantRequest::TryDel {
                key: key.to_string(),
                tx_id: tx_id.to_string(),
                death,
            },
        )
        .await
    }

    async fn commit(&self, tx_id: &str, death: ParticipantDeath) -> Result<bool> {
        self.ack(
            "commit",
            &ParticipantRequest::Commit {
                tx_id: tx_id.to_string(),
                death,
            },
        )
        .await
    }

    async fn abort(&self, tx_id: &str) -> Result<bool> {
        self.ack(
            "abort",
            &ParticipantRequest::Abort {
                tx_id: tx_id.to_string(),
            },
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<String> {
        match self
            .rpc
            .call(&ParticipantRequest::Get {
                key: key.to_string(),
            })
            .await?
        {
            ParticipantResponse::Value(value) => Ok(value),
            other => Err(unexpected("get", &other)),
        }
    }
}
