//! Per-peer session: handshake, heartbeat, framed receive loop, dispatch.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};

use kizuna_protocol::{
    envelope::{now_ms, Envelope},
    keys,
    message::{self, PeerMessage},
    HEARTBEAT_INTERVAL_MS,
};

use crate::overlay::{read_frame, write_frame, PeerStream};
use crate::state::{Node, PeerEntry, SharedWriter};
use crate::tasks;

/// Take ownership of a fresh authenticated stream and run its session.
pub fn spawn(node: Arc<Node>, peer_key: String, stream: Box<dyn PeerStream>) {
    tokio::spawn(run_session(node, peer_key, stream));
}

async fn run_session(node: Arc<Node>, peer_key: String, stream: Box<dyn PeerStream>) {
    let short = keys::short_id(&peer_key).to_string();
    let (mut reader, writer) = tokio::io::split(stream);
    let writer: SharedWriter = Arc::new(Mutex::new(writer));

    // 1. Signed handshake goes out before anything else.
    let handshake = node.handshake_envelope().await;
    if write_envelope(&writer, &handshake).await.is_err() {
        tracing::debug!(peer = %short, "handshake write failed; dropping stream");
        return;
    }

    // 2. Heartbeat: a bare ping frame every 2.5 s until a write fails or the
    //    entry is removed.
    let heartbeat = tokio::spawn(heartbeat_loop(writer.clone(), short.clone()));

    // 3. Install the peer entry; this session owns it.
    let shutdown = Arc::new(Notify::new());
    node.install_peer(
        peer_key.clone(),
        PeerEntry {
            writer: writer.clone(),
            last_seen: AtomicU64::new(now_ms()),
            manifest: RwLock::new(None),
            heartbeat,
            shutdown: shutdown.clone(),
        },
    )
    .await;
    tracing::info!(peer = %short, "peer session established");

    // 4. Receive loop. The shutdown arm keeps eviction from waiting on a
    //    peer that never writes.
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(bytes) => handle_frame(&node, &peer_key, &bytes).await,
                Err(e) => {
                    tracing::debug!(peer = %short, "stream ended: {e}");
                    break;
                }
            }
        }
    }

    node.remove_peer(&peer_key, "session ended").await;
}

async fn heartbeat_loop(writer: SharedWriter, short: String) {
    let frame = message::ping_frame().to_string().into_bytes();
    let mut ticker = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    loop {
        ticker.tick().await;
        if write_frame(&mut *writer.lock().await, &frame).await.is_err() {
            tracing::debug!(peer = %short, "heartbeat write failed; timer stopped");
            break;
        }
    }
}

pub async fn write_envelope(writer: &SharedWriter, env: &Envelope) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(env).map_err(std::io::Error::other)?;
    write_frame(&mut *writer.lock().await, &bytes).await
}

// ============================================================================
// Frame dispatch
// ============================================================================

async fn handle_frame(node: &Arc<Node>, peer_key: &str, bytes: &[u8]) {
    let short = keys::short_id(peer_key);

    // One frame, one JSON object. Anything else is transport noise.
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(peer = %short, "dropping malformed frame: {e}");
            return;
        }
    };

    node.touch_peer(peer_key).await;

    // Heartbeats are unsigned and only refresh liveness.
    if message::is_ping(&value) {
        return;
    }

    if value.get("signature").is_none() || value.get("senderKey").is_none() {
        tracing::debug!(peer = %short, "dropping unsigned non-ping frame");
        return;
    }

    let env: Envelope = match serde_json::from_value(value) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(peer = %short, "dropping malformed envelope: {e}");
            return;
        }
    };

    // Per-envelope trust: verification uses the envelope's own senderKey.
    let inner = match env.open() {
        Ok(inner) => inner,
        Err(e) => {
            tracing::warn!(peer = %short, "dropping envelope: {e}");
            return;
        }
    };

    dispatch(node, peer_key, &env, inner).await;
}

async fn dispatch(node: &Arc<Node>, peer_key: &str, env: &Envelope, inner: Value) {
    match PeerMessage::from_value(inner.clone()) {
        PeerMessage::Handshake(manifest) => {
            tracing::debug!(
                peer = %keys::short_id(peer_key),
                agent = %manifest.agent_id,
                "handshake manifest recorded"
            );
            node.set_peer_manifest(peer_key, manifest).await;
        }
        PeerMessage::TaskRequest(msg) => {
            tasks::handle_task_request(node, &env.sender_key, msg).await;
            node.push_inbox(&env.sender_key, inner).await;
        }
        PeerMessage::TaskResponse(msg) => {
            tasks::handle_task_response(node, msg).await;
        }
        PeerMessage::Chat(value) => {
            node.push_inbox(&env.sender_key, value).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
