//! Framed JSON request/reply transport for the coordinator and participant
//! services.
//!
//! Every frame is a length-delimited `serde_json` payload. Requests are the
//! per-service enums below; replies travel as `Result<_, String>` envelopes
//! so service-level failures arrive as data instead of broken connections.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use pact_commit::twopc::{CoordinatorDeath, ParticipantDeath, TxState};

/// Requests accepted by the coordinator service.
#[derive(Debug, Serialize, Deserialize)]
pub enum CoordinatorRequest {
    Get {
        key: String,
    },
    /// Test variant of `Get` pinned to one participant.
    GetFrom {
        key: String,
        participant: usize,
    },
    Put {
        key: String,
        value: String,
    },
    Del {
        key: String,
    },
    /// Test variant of `Put` carrying crash-injection points.
    PutTest {
        key: String,
        value: String,
        death: CoordinatorDeath,
        participant_deaths: Vec<ParticipantDeath>,
    },
    /// Test variant of `Del` carrying crash-injection points.
    DelTest {
        key: String,
        death: CoordinatorDeath,
        participant_deaths: Vec<ParticipantDeath>,
    },
    Status {
        tx_id: String,
    },
    Ping {
        key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum CoordinatorResponse {
    Value(String),
    Done,
    Status(TxState),
    Pong(String),
}

/// Requests accepted by the participant service.
#[derive(Debug, Serialize, Deserialize)]
pub enum ParticipantRequest {
    Get {
        key: String,
    },
    TryPut {
        key: String,
        value: String,
        tx_id: String,
        death: ParticipantDeath,
    },
    TryDel {
        key: String,
        tx_id: String,
        death: ParticipantDeath,
    },
    Commit {
        tx_id: String,
        death: ParticipantDeath,
    },
    Abort {
        tx_id: String,
    },
    Ping {
        key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ParticipantResponse {
    Value(String),
    Ack { success: bool },
    Pong(String),
}

/// Server side of one request/reply surface.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Response: Serialize + Send;

    async fn handle(&self, request: Self::Request) -> Result<Self::Response>;
}

fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Accept connections forever, serving each on its own task.
pub async fn serve<S: Service>(listener: TcpListener, service: Arc<S>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept connection")?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, service).await {
                debug!(%peer, error = %err, "connection closed");
            }
        });
    }
}

async fn serve_connection<S: Service>(stream: TcpStream, service: Arc<S>) -> Result<()> {
    let mut frames = framed(stream);
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let request: S::Request = serde_json::from_slice(&frame)?;
        let reply: Result<S::Response, String> = match service.handle(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                debug!(error = %err, "request failed");
                Err(err.to_string())
            }
        };
        let payload = serde_json::to_vec(&reply)?;
        frames.send(Bytes::from(payload)).await?;
    }
    Ok(())
}

/// One-connection JSON-RPC client with lazy dialing. Any transport error
/// drops the connection so the next call redials.
pub struct RpcClient {
    addr: SocketAddr,
    conn: Mutex<Option<Framed<TcpStream, LengthDelimitedCodec>>>,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            let stream = TcpStream::connect(self.addr)
                .await
                .with_context(|| format!("connect {}", self.addr))?;
            *conn = Some(framed(stream));
        }
        let Some(frames) = conn.as_mut() else {
            anyhow::bail!("connection unavailable");
        };

        match Self::exchange(frames, request).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(err) => {
                // Drop the broken connection; the next call redials.
                *conn = None;
                Err(err)
            }
        }
    }

    async fn exchange<Req, Resp>(
        frames: &mut Framed<TcpStream, LengthDelimitedCodec>,
        request: &Req,
    ) -> Result<Result<Resp, String>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        frames
            .send(Bytes::from(payload))
            .await
            .context("send request")?;
        let frame = frames
            .next()
            .await
            .context("connection closed before reply")??;
        Ok(serde_json::from_slice(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        type Request = String;
        type Response = String;

        async fn handle(&self, request: String) -> Result<String> {
            anyhow::ensure!(request != "boom", "injected service failure");
            Ok(request)
        }
    }

    #[tokio::test]
    async fn round_trips_requests_and_service_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(serve(listener, Arc::new(Echo)));

        let client = RpcClient::new(addr);
        let reply: String = client.call(&"hello".to_string()).await.expect("call");
        assert_eq!(reply, "hello");

        let err = client
            .call::<String, String>(&"boom".to_string())
            .await
            .expect_err("service error");
        assert!(err.to_string().contains("injected service failure"));

        // The connection survives a service-level error.
        let reply: String = client.call(&"again".to_string()).await.expect("call");
        assert_eq!(reply, "again");
    }

    #[tokio::test]
    async fn a_dead_peer_surfaces_as_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = RpcClient::new(addr);
        assert!(client.call::<String, String>(&"hello".to_string()).await.is_err());
    }
}
