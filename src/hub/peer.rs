//! Outbound peer subscriptions.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{PeerError, ProtocolError};
use crate::hub::{Hub, WireMessage};

/// Subscribes to the given peer and applies every patch it streams back.
///
/// The "known peers" set dedups parallel attempts against the same
/// address: the configured-peer task at boot and the dial-back triggered
/// by an inbound `SubscribeI2R` may race, and only one survives. The
/// address is forgotten when the connection ends, whatever the reason;
/// there is no automatic reconnect.
pub(crate) async fn subscribe_to(hub: Arc<Hub>, peer_addr: String) {
    let cursor = {
        let mut shared = hub.shared.lock().await;
        if !shared.peers.insert(peer_addr.clone()) {
            // Already streaming from this peer.
            return;
        }
        shared.store.log().head().clone()
    };

    if let Err(e) = run(&hub, &peer_addr, cursor).await {
        warn!(peer = %peer_addr, error = %e, "peer subscription ended");
    } else {
        debug!(peer = %peer_addr, "peer connection closed");
    }

    let mut shared = hub.shared.lock().await;
    shared.peers.remove(&peer_addr);
}

async fn run(
    hub: &Arc<Hub>,
    peer_addr: &str,
    cursor: gossamer_crdt::VersionVector,
) -> Result<(), PeerError> {
    let ws = match connect_async(format!("ws://{}", peer_addr)).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            // Dial failure: log and forget the peer.
            warn!(peer = %peer_addr, error = %e, "dial failed");
            return Ok(());
        }
    };
    info!(peer = %peer_addr, "established peer connection");

    let (mut sink, mut stream) = ws.split();
    let subscribe = WireMessage::SubscribeI2R {
        agent_id: hub.agent_id,
        addr: hub.addr.clone(),
        version_vector: cursor,
    };
    sink.send(Message::Text(serde_json::to_string(&subscribe)?))
        .await?;

    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Message::Text(t) => t,
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                debug!(peer = %peer_addr, frame = ?other, "ignoring non-text frame");
                continue;
            }
        };
        let msg: WireMessage = serde_json::from_str(&text).map_err(ProtocolError::Malformed)?;
        let WireMessage::PatchR2I {
            agent_id,
            agent_seq,
            key,
            dtype,
            patch,
        } = msg
        else {
            return Err(ProtocolError::UnexpectedMessage("expected PatchR2I").into());
        };

        let mut shared = hub.shared.lock().await;
        shared
            .store
            .apply_server_patch(agent_id, agent_seq, &key, dtype, &patch)?;
    }
    Ok(())
}
