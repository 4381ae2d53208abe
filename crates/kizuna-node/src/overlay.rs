//! Overlay plumbing: the connection-source seam, wire framing, and topic
//! membership.
//!
//! The DHT that performs actual peer discovery is an external collaborator.
//! The node consumes it through `ConnectionSource`: a stream of
//! authenticated `(peer public key, duplex stream)` pairs plus advisory
//! join/leave calls. The in-tree `TcpSource` implements the same contract
//! over plain TCP (listen + seed dials, one hello frame carrying each
//! side's SPKI hex) so a node is runnable without the DHT daemon.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use kizuna_protocol::{
    envelope::now_ms, keys, topic::topic_hash, ProtocolError, DEFAULT_TOPIC, MAX_FRAME_SIZE,
};

use crate::session;
use crate::state::{Node, TopicEntry};

// ============================================================================
// Stream + source seam
// ============================================================================

pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// One authenticated connection surfaced by the overlay.
pub struct NewPeer {
    /// The remote's full SPKI DER public key as hex.
    pub public_key: String,
    pub stream: Box<dyn PeerStream>,
}

/// Topic control forwarded to the discovery layer.
#[derive(Debug, Clone, Copy)]
pub enum SourceCommand {
    Join([u8; 32]),
    Leave([u8; 32]),
}

#[async_trait]
pub trait ConnectionSource: Send {
    /// Advertise interest in a topic hash. Advisory.
    async fn join(&mut self, topic_hash: [u8; 32]) -> anyhow::Result<()>;
    /// Withdraw interest. Advisory; existing sessions are not torn down.
    async fn leave(&mut self, topic_hash: [u8; 32]) -> anyhow::Result<()>;
    /// The next inbound or outbound-dialed peer. `None` means the source is
    /// gone for good.
    async fn next_peer(&mut self) -> Option<NewPeer>;
}

// ============================================================================
// Frame codec: 4-byte LE length prefix + one JSON object
// ============================================================================

pub async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::FrameTooLarge { size: len, limit: MAX_FRAME_SIZE }.to_string(),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(io: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::FrameTooLarge { size: data.len(), limit: MAX_FRAME_SIZE }.to_string(),
        ));
    }
    io.write_all(&(data.len() as u32).to_le_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await
}

// ============================================================================
// Accept loop
// ============================================================================

/// Drive the connection source: forward topic commands and spawn a session
/// for every surfaced peer.
pub async fn run(
    node: Arc<Node>,
    mut source: impl ConnectionSource,
    mut ctl: mpsc::Receiver<SourceCommand>,
) {
    loop {
        tokio::select! {
            Some(cmd) = ctl.recv() => {
                let result = match cmd {
                    SourceCommand::Join(hash) => source.join(hash).await,
                    SourceCommand::Leave(hash) => source.leave(hash).await,
                };
                if let Err(e) = result {
                    tracing::warn!("topic command failed: {e}");
                }
            }
            peer = source.next_peer() => match peer {
                Some(p) => {
                    tracing::debug!(peer = %keys::short_id(&p.public_key), "new peer stream");
                    session::spawn(node.clone(), p.public_key, p.stream);
                }
                None => {
                    tracing::warn!("connection source closed; no further peers");
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Topic membership
// ============================================================================

/// Join a topic. Idempotent: re-joining returns the existing entry.
pub async fn join_topic(node: &Node, name: &str, secret: Option<&str>) -> TopicEntry {
    let private = secret.is_some_and(|s| !s.is_empty());
    let hash = topic_hash(name, secret);

    let entry = {
        let mut topics = node.topics.write().await;
        if let Some(existing) = topics.get(name) {
            return existing.clone();
        }
        let entry = TopicEntry {
            topic_hash: hex::encode(hash),
            private,
            joined_at: now_ms(),
        };
        topics.insert(name.to_string(), entry.clone());
        entry
    };

    if node.source_ctl.send(SourceCommand::Join(hash)).await.is_err() {
        tracing::warn!("overlay loop gone; topic join not forwarded");
    }
    tracing::info!(topic = name, private, "joined topic");
    entry
}

/// Leave a topic. The default topic is unleavable; existing sessions stay up.
pub async fn leave_topic(node: &Node, name: &str) -> Result<bool, &'static str> {
    if name == DEFAULT_TOPIC {
        return Err("the default topic cannot be left");
    }
    let removed = node.topics.write().await.remove(name);
    match removed {
        Some(entry) => {
            let mut hash = [0u8; 32];
            if let Ok(bytes) = hex::decode(&entry.topic_hash) {
                if bytes.len() == 32 {
                    hash.copy_from_slice(&bytes);
                }
            }
            if node.source_ctl.send(SourceCommand::Leave(hash)).await.is_err() {
                tracing::warn!("overlay loop gone; topic leave not forwarded");
            }
            tracing::info!(topic = name, "left topic");
            Ok(true)
        }
        None => Ok(false),
    }
}

// ============================================================================
// TCP source
// ============================================================================

/// Plain-TCP stand-in for the DHT: accepts inbound connections, dials seed
/// peers once at startup, and authenticates each stream with a single
/// length-prefixed hello frame carrying the sender's SPKI hex.
pub struct TcpSource {
    incoming: mpsc::Receiver<NewPeer>,
}

impl TcpSource {
    pub async fn bind(
        listen: SocketAddr,
        seeds: &[SocketAddr],
        local_key: String,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        tracing::info!("overlay listening on {}", listener.local_addr()?);

        let (tx, rx) = mpsc::channel(16);

        let accept_tx = tx.clone();
        let accept_key = local_key.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tracing::debug!("inbound overlay connection from {addr}");
                        tokio::spawn(hello(stream, accept_tx.clone(), accept_key.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("overlay accept failed: {e}");
                        break;
                    }
                }
            }
        });

        for seed in seeds {
            let seed = *seed;
            let dial_tx = tx.clone();
            let dial_key = local_key.clone();
            tokio::spawn(async move {
                match TcpStream::connect(seed).await {
                    Ok(stream) => hello(stream, dial_tx, dial_key).await,
                    Err(e) => tracing::warn!("dial {seed} failed: {e}"),
                }
            });
        }

        Ok(Self { incoming: rx })
    }
}

/// Exchange hello frames (ours first) and surface the authenticated stream.
async fn hello(mut stream: TcpStream, tx: mpsc::Sender<NewPeer>, local_key: String) {
    if write_frame(&mut stream, local_key.as_bytes()).await.is_err() {
        return;
    }
    let peer_key = match read_frame(&mut stream).await {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => return,
        },
        Err(e) => {
            tracing::debug!("hello read failed: {e}");
            return;
        }
    };
    if keys::verifying_key_from_spki_hex(&peer_key).is_err() {
        tracing::warn!("dropping overlay connection with invalid hello key");
        return;
    }
    let _ = tx
        .send(NewPeer { public_key: peer_key, stream: Box::new(stream) })
        .await;
}

#[async_trait]
impl ConnectionSource for TcpSource {
    async fn join(&mut self, topic_hash: [u8; 32]) -> anyhow::Result<()> {
        // The TCP transport has no rendezvous; membership is advisory.
        tracing::debug!("topic join {} (advisory)", hex::encode(topic_hash));
        Ok(())
    }

    async fn leave(&mut self, topic_hash: [u8; 32]) -> anyhow::Result<()> {
        tracing::debug!("topic leave {} (advisory)", hex::encode(topic_hash));
        Ok(())
    }

    async fn next_peer(&mut self) -> Option<NewPeer> {
        self.incoming.recv().await
    }
}

// ============================================================================
// Tests
// ============================================================================
