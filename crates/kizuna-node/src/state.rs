//! Shared node state.
//!
//! Every table is guarded by its own lock and mutated only under it; no task
//! holds two table locks at once except peers → per-entry field locks. Peer
//! writers additionally sit behind a per-peer mutex so at most one socket
//! write is in flight per peer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::WriteHalf;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use kizuna_protocol::{
    envelope::{now_ms, Envelope},
    keys,
    message::PeerMessage,
    Manifest, INBOX_CAPACITY,
};

use crate::{
    config::Config,
    identity::NodeIdentity,
    overlay::{write_frame, PeerStream, SourceCommand},
    store::{BlobStore, MemoryLog},
    tasks::{DeadLetterTask, ReceivedTask, SentTask},
};

pub type SharedWriter = Arc<Mutex<WriteHalf<Box<dyn PeerStream>>>>;

// ============================================================================
// Table records
// ============================================================================

/// One live peer. Exists exactly while its session task runs.
pub struct PeerEntry {
    /// Write half of the duplex stream; the mutex serialises socket writes.
    pub writer: SharedWriter,
    /// Millisecond wall clock of the last inbound frame. Monotone via
    /// `fetch_max`.
    pub last_seen: AtomicU64,
    /// Advertised capabilities, populated by the peer's handshake.
    pub manifest: RwLock<Option<Manifest>>,
    /// The 2.5 s ping task; aborted when the entry is removed.
    pub heartbeat: JoinHandle<()>,
    /// Wakes the session's receive loop on eviction.
    pub shutdown: Arc<Notify>,
}

impl PeerEntry {
    pub fn touch(&self) {
        self.last_seen.fetch_max(now_ms(), Ordering::Relaxed);
    }
}

/// Read-only view of a peer for the control plane.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub public_key: String,
    pub short_id: String,
    pub last_seen: u64,
    pub manifest: Option<Manifest>,
}

/// One delivered inbox record. Reading the inbox drains it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub sender: String,
    pub sender_short_id: String,
    pub timestamp: u64,
    pub content: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicEntry {
    pub topic_hash: String,
    pub private: bool,
    pub joined_at: u64,
}

// ============================================================================
// Node
// ============================================================================

pub struct Node {
    pub config: Config,
    pub identity: NodeIdentity,
    pub manifest: RwLock<Manifest>,

    pub peers: RwLock<HashMap<String, PeerEntry>>,
    pub sent_tasks: RwLock<HashMap<String, SentTask>>,
    pub received_tasks: RwLock<HashMap<String, ReceivedTask>>,
    pub dead_letter: RwLock<HashMap<String, DeadLetterTask>>,
    pub inbox: Mutex<VecDeque<InboxMessage>>,
    pub topics: RwLock<HashMap<String, TopicEntry>>,

    /// Every peer id ever observed, self included. Grows monotonically.
    pub observed_peers: Mutex<HashSet<String>>,
    pub entropy_enabled: AtomicBool,
    pub started_at: u64,

    pub source_ctl: mpsc::Sender<SourceCommand>,
    pub memory: MemoryLog,
    pub drive: BlobStore,
}

impl Node {
    pub fn new(
        config: Config,
        identity: NodeIdentity,
        source_ctl: mpsc::Sender<SourceCommand>,
    ) -> Arc<Self> {
        let manifest = Manifest {
            role: config.role.clone(),
            skills: config.skills.clone(),
            agent_id: config.agent_name.clone(),
            specs: None,
        };
        let memory = MemoryLog::new(config.data_dir.join("memory.log"));
        let drive = BlobStore::new(config.data_dir.join("drive"));
        let mut observed = HashSet::new();
        observed.insert(identity.public_key.clone());
        let entropy = config.entropy;

        Arc::new(Self {
            config,
            identity,
            manifest: RwLock::new(manifest),
            peers: RwLock::new(HashMap::new()),
            sent_tasks: RwLock::new(HashMap::new()),
            received_tasks: RwLock::new(HashMap::new()),
            dead_letter: RwLock::new(HashMap::new()),
            inbox: Mutex::new(VecDeque::new()),
            topics: RwLock::new(HashMap::new()),
            observed_peers: Mutex::new(observed),
            entropy_enabled: AtomicBool::new(entropy),
            started_at: now_ms(),
            source_ctl,
            memory,
            drive,
        })
    }

    // ========================================================================
    // Peer table
    // ========================================================================

    pub async fn install_peer(&self, key: String, entry: PeerEntry) {
        self.observed_peers.lock().await.insert(key.clone());
        if let Some(old) = self.peers.write().await.insert(key.clone(), entry) {
            // A reconnect raced an undead entry; retire the old session.
            // notify_one stores a permit, so the signal lands even if the
            // old receive loop is mid-dispatch rather than parked.
            old.heartbeat.abort();
            old.shutdown.notify_one();
            tracing::debug!(peer = %keys::short_id(&key), "replaced stale peer entry");
        }
    }

    /// Remove a peer exactly once: take the entry out of the table, cancel
    /// its heartbeat, and wake its receive loop. Dropping the entry releases
    /// the stream halves.
    pub async fn remove_peer(&self, key: &str, reason: &str) -> bool {
        let removed = self.peers.write().await.remove(key);
        match removed {
            Some(entry) => {
                entry.heartbeat.abort();
                entry.shutdown.notify_one();
                tracing::info!(peer = %keys::short_id(key), reason, "peer removed");
                true
            }
            None => false,
        }
    }

    pub async fn touch_peer(&self, key: &str) {
        if let Some(entry) = self.peers.read().await.get(key) {
            entry.touch();
        }
    }

    pub async fn set_peer_manifest(&self, key: &str, manifest: Manifest) {
        if let Some(entry) = self.peers.read().await.get(key) {
            *entry.manifest.write().await = Some(manifest);
        }
    }

    /// Resolve a task target: the peer's short id, or its advertised
    /// agent_id compared case-insensitively.
    pub async fn find_peer_key(&self, target: &str) -> Option<String> {
        let peers = self.peers.read().await;
        for (key, entry) in peers.iter() {
            if keys::short_id(key) == target {
                return Some(key.clone());
            }
            if let Some(m) = entry.manifest.read().await.as_ref() {
                if m.agent_id.eq_ignore_ascii_case(target) {
                    return Some(key.clone());
                }
            }
        }
        None
    }

    pub async fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let peers = self.peers.read().await;
        let mut out = Vec::with_capacity(peers.len());
        for (key, entry) in peers.iter() {
            out.push(PeerSnapshot {
                public_key: key.clone(),
                short_id: keys::short_id(key).to_string(),
                last_seen: entry.last_seen.load(Ordering::Relaxed),
                manifest: entry.manifest.read().await.clone(),
            });
        }
        out
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send one envelope to one peer.
    pub async fn send_to_peer(&self, key: &str, env: &Envelope) -> anyhow::Result<()> {
        let writer = {
            let peers = self.peers.read().await;
            peers
                .get(key)
                .map(|e| e.writer.clone())
                .ok_or_else(|| anyhow::anyhow!("peer not connected"))?
        };
        let bytes = serde_json::to_vec(env)?;
        write_frame(&mut *writer.lock().await, &bytes).await?;
        Ok(())
    }

    /// Fan one envelope out to every live peer. Returns the delivered count;
    /// per-peer write failures are left for the timeout reaper to collect.
    pub async fn broadcast(&self, env: &Envelope) -> usize {
        let writers: Vec<(String, SharedWriter)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(k, e)| (k.clone(), e.writer.clone()))
            .collect();

        let bytes = match serde_json::to_vec(env) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("broadcast serialize failed: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for (key, writer) in writers {
            match write_frame(&mut *writer.lock().await, &bytes).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(peer = %keys::short_id(&key), "broadcast write failed: {e}")
                }
            }
        }
        delivered
    }

    /// Signed handshake envelope carrying the current local manifest.
    pub async fn handshake_envelope(&self) -> Envelope {
        let manifest = self.manifest.read().await.clone();
        self.identity
            .sign(&PeerMessage::Handshake(manifest).to_value())
    }

    // ========================================================================
    // Inbox
    // ========================================================================

    pub async fn push_inbox(&self, sender: &str, content: Value) {
        let mut inbox = self.inbox.lock().await;
        if inbox.len() >= INBOX_CAPACITY {
            inbox.pop_front();
        }
        inbox.push_back(InboxMessage {
            sender: sender.to_string(),
            sender_short_id: keys::short_id(sender).to_string(),
            timestamp: now_ms(),
            content,
        });
    }

    /// Atomic drain: two successive reads never return the same record twice.
    pub async fn drain_inbox(&self) -> Vec<InboxMessage> {
        let mut inbox = self.inbox.lock().await;
        std::mem::take(&mut *inbox).into()
    }
}
