//! Shared fixtures: nodes with throwaway identities, wired over in-memory
//! duplex pipes instead of the overlay.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::identity::NodeIdentity;
use crate::overlay::SourceCommand;
use crate::session;
use crate::state::Node;

/// Build a node with a fresh identity in a temp data dir. The receiver and
/// the dir must stay alive for the duration of the test.
pub fn test_node(agent_name: &str) -> (Arc<Node>, TempDir, mpsc::Receiver<SourceCommand>) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::parse_from([
        "kizuna-node",
        "--data-dir",
        dir.path().to_str().unwrap(),
        "--agent-name",
        agent_name,
    ]);
    let identity = NodeIdentity::load_or_create(dir.path()).unwrap();
    let (ctl_tx, ctl_rx) = mpsc::channel(16);
    (Node::new(config, identity, ctl_tx), dir, ctl_rx)
}

/// Wire two nodes together the way the overlay would: one duplex stream,
/// one session each side, keyed by the other's public key.
pub fn connect(a: &Arc<Node>, b: &Arc<Node>) {
    let (side_a, side_b) = tokio::io::duplex(65536);
    session::spawn(a.clone(), b.identity.public_key.clone(), Box::new(side_a));
    session::spawn(b.clone(), a.identity.public_key.clone(), Box::new(side_b));
}

/// Let spawned sessions exchange handshakes and settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
