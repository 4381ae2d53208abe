//! Background tickers: peer timeout, entropy churn, task retry.
//!
//! Each pass body is a free function so tests can drive a tick directly
//! without waiting on wall-clock timers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kizuna_protocol::{
    envelope::now_ms, ENTROPY_DROP_PROBABILITY, ENTROPY_REAP_INTERVAL_MS, PEER_TIMEOUT_MS,
    RETRY_REAP_INTERVAL_MS, TIMEOUT_REAP_INTERVAL_MS,
};

use crate::state::Node;
use crate::tasks;

pub fn spawn_all(node: Arc<Node>) {
    {
        let node = node.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(TIMEOUT_REAP_INTERVAL_MS));
            loop {
                ticker.tick().await;
                timeout_pass(&node).await;
            }
        });
    }
    {
        let node = node.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(ENTROPY_REAP_INTERVAL_MS));
            loop {
                ticker.tick().await;
                entropy_pass(&node).await;
            }
        });
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(RETRY_REAP_INTERVAL_MS));
        loop {
            ticker.tick().await;
            tasks::retry_pass(&node).await;
        }
    });
}

/// Evict peers whose last inbound frame is older than the timeout. With one
/// ping per 2.5 s that is roughly three missed heartbeats.
pub async fn timeout_pass(node: &Node) {
    let now = now_ms();
    let expired: Vec<String> = node
        .peers
        .read()
        .await
        .iter()
        .filter(|(_, entry)| {
            now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) > PEER_TIMEOUT_MS
        })
        .map(|(key, _)| key.clone())
        .collect();

    for key in expired {
        node.remove_peer(&key, "heartbeat timeout").await;
    }
}

/// Fault injection: when enabled, each peer is independently dropped with
/// probability 0.5 per tick. Off by default.
pub async fn entropy_pass(node: &Node) {
    if !node.entropy_enabled.load(Ordering::Relaxed) {
        return;
    }
    let victims: Vec<String> = node
        .peers
        .read()
        .await
        .keys()
        .filter(|_| rand::random::<f64>() < ENTROPY_DROP_PROBABILITY)
        .cloned()
        .collect();

    for key in victims {
        node.remove_peer(&key, "entropy churn").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{connect, settle, test_node};

    #[tokio::test]
    async fn entropy_pass_is_inert_when_disabled() {
        let (a, _da, _ca) = test_node("alice");
        let (b, _db, _cb) = test_node("bob");
        connect(&a, &b);
        settle().await;

        a.entropy_enabled.store(false, Ordering::Relaxed);
        for _ in 0..10 {
            entropy_pass(&a).await;
        }
        assert_eq!(a.peers.read().await.len(), 1);
    }

    #[tokio::test]
    async fn entropy_pass_eventually_drops_peers_when_enabled() {
        let (a, _da, _ca) = test_node("alice");
        let (b, _db, _cb) = test_node("bob");
        connect(&a, &b);
        settle().await;

        a.entropy_enabled.store(true, Ordering::Relaxed);
        // P(survive 40 coin flips) = 2^-40; effectively deterministic.
        for _ in 0..40 {
            entropy_pass(&a).await;
        }
        assert!(a.peers.read().await.is_empty());
    }

    #[tokio::test]
    async fn timeout_pass_keeps_fresh_peers() {
        let (a, _da, _ca) = test_node("alice");
        let (b, _db, _cb) = test_node("bob");
        connect(&a, &b);
        settle().await;

        timeout_pass(&a).await;
        assert_eq!(a.peers.read().await.len(), 1);
    }
}
