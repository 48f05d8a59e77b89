//! Integration test infrastructure: in-process agents and raw WebSocket
//! test clients.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gossamer_crdt::DType;
use gossamerd::{Config, Hub, WireMessage};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// An agent running inside the test process on an ephemeral port.
pub struct TestAgent {
    pub hub: Arc<Hub>,
    identity_path: Option<std::path::PathBuf>,
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        if let Some(path) = &self.identity_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl TestAgent {
    /// Spawn an agent with no peers and a random identity.
    pub async fn spawn() -> anyhow::Result<TestAgent> {
        Self::builder().spawn().await
    }

    pub fn builder() -> TestAgentBuilder {
        TestAgentBuilder::default()
    }

    pub fn addr(&self) -> String {
        self.hub.addr().to_string()
    }

    pub fn agent_id(&self) -> u32 {
        self.hub.agent_id()
    }

    /// Connect a subscribed client: the snapshot is drained and returned.
    pub async fn client(&self) -> anyhow::Result<(TestClient, Vec<(String, DType, String)>)> {
        let mut client = TestClient::connect(&self.addr()).await?;
        client.send(WireMessage::SubscribeC2S).await?;
        let snapshot = client.read_snapshot().await?;
        Ok((client, snapshot))
    }
}

#[derive(Default)]
pub struct TestAgentBuilder {
    agent_id: Option<u32>,
    peer_addrs: Vec<String>,
}

impl TestAgentBuilder {
    /// Pin the agent id by writing it to a throwaway identity file.
    pub fn agent_id(mut self, agent_id: u32) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn peer(mut self, addr: &str) -> Self {
        self.peer_addrs.push(addr.to_string());
        self
    }

    pub async fn spawn(self) -> anyhow::Result<TestAgent> {
        let identity_path = match self.agent_id {
            Some(agent_id) => {
                // Unique per spawn: tests run in parallel and may pin the
                // same agent id.
                let nonce = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_nanos();
                let path = std::env::temp_dir().join(format!(
                    "gossamer-test-{}-{}-{}",
                    std::process::id(),
                    agent_id,
                    nonce
                ));
                std::fs::write(&path, agent_id.to_string())?;
                Some(path)
            }
            None => None,
        };
        let config = Config {
            listen_addr: "127.0.0.1:0".to_string(),
            peer_addrs: self.peer_addrs,
            identity_path: identity_path.clone(),
            seed: None,
        };
        let hub = Hub::serve(config).await?;
        Ok(TestAgent { hub, identity_path })
    }
}

/// A raw protocol client over a real WebSocket connection.
pub struct TestClient {
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl TestClient {
    pub async fn connect(addr: &str) -> anyhow::Result<TestClient> {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await?;
        let (write, read) = ws.split();
        Ok(TestClient { write, read })
    }

    pub async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()> {
        let text = serde_json::to_string(&msg)?;
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Sends a raw text frame, bypassing message encoding.
    pub async fn send_raw(&mut self, text: &str) -> anyhow::Result<()> {
        self.write.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Sends a binary frame (always a protocol violation).
    pub async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
        self.write.send(Message::Binary(data)).await?;
        Ok(())
    }

    pub async fn send_patch(&mut self, key: &str, dtype: DType, patch: &str) -> anyhow::Result<()> {
        self.send(WireMessage::PatchC2S {
            key: key.to_string(),
            dtype,
            patch: patch.to_string(),
        })
        .await
    }

    /// Next protocol message, with a timeout.
    pub async fn recv(&mut self) -> anyhow::Result<WireMessage> {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for a message"))?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            match frame {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => anyhow::bail!("connection closed"),
                _ => continue,
            }
        }
    }

    /// Waits for the server to drop the connection.
    pub async fn expect_closed(&mut self) -> anyhow::Result<()> {
        loop {
            match timeout(RECV_TIMEOUT, self.read.next()).await {
                Err(_) => anyhow::bail!("connection still open"),
                Ok(None) => return Ok(()),
                Ok(Some(Ok(Message::Close(_)))) => return Ok(()),
                Ok(Some(Ok(Message::Text(text)))) => {
                    anyhow::bail!("expected close, got message: {}", text)
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return Ok(()),
            }
        }
    }

    /// Asserts the connection stays silent for a moment.
    pub async fn expect_silence(&mut self, wait: Duration) -> anyhow::Result<()> {
        match timeout(wait, self.read.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Text(text)))) => anyhow::bail!("unexpected message: {}", text),
            Ok(_) => anyhow::bail!("connection closed while expecting silence"),
        }
    }

    /// Reads `ValueS2C` messages up to the `ValuesDoneS2C` sentinel.
    pub async fn read_snapshot(&mut self) -> anyhow::Result<Vec<(String, DType, String)>> {
        let mut values = Vec::new();
        loop {
            match self.recv().await? {
                WireMessage::ValueS2C { key, dtype, value } => values.push((key, dtype, value)),
                WireMessage::ValuesDoneS2C => return Ok(values),
                other => anyhow::bail!("unexpected message during snapshot: {:?}", other),
            }
        }
    }

    /// Next `PatchS2C`.
    pub async fn recv_patch(&mut self) -> anyhow::Result<PatchS2C> {
        match self.recv().await? {
            WireMessage::PatchS2C {
                agent_id,
                is_local,
                key,
                dtype,
                patch,
            } => Ok(PatchS2C {
                agent_id,
                is_local,
                key,
                dtype,
                patch,
            }),
            other => anyhow::bail!("expected PatchS2C, got {:?}", other),
        }
    }
}

pub struct PatchS2C {
    pub agent_id: u32,
    pub is_local: bool,
    pub key: String,
    pub dtype: DType,
    pub patch: String,
}

/// Polls until the agent's log head equals `want`.
pub async fn wait_for_head(
    agent: &TestAgent,
    want: &gossamer_crdt::VersionVector,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if agent.hub.head().await == *want {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!(
        "agent {} never reached head {:?}",
        agent.agent_id(),
        want
    )
}
