mod a2a;
mod api;
mod config;
mod identity;
mod overlay;
mod reaper;
mod session;
mod state;
mod store;
mod tasks;
#[cfg(test)]
mod testutil;

use clap::Parser;
use tokio::sync::mpsc;

use kizuna_protocol::DEFAULT_TOPIC;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kizuna_node=info".parse().unwrap()),
        )
        .init();

    let config = config::Config::parse();
    std::fs::create_dir_all(&config.data_dir)?;
    let identity = identity::NodeIdentity::load_or_create(&config.data_dir)?;

    tracing::info!(
        short_id = %identity.short_id,
        agent = %config.agent_name,
        "kizuna node starting",
    );

    let (ctl_tx, ctl_rx) = mpsc::channel(16);
    let node = state::Node::new(config.clone(), identity, ctl_tx);

    let source = overlay::TcpSource::bind(
        config.peer_listen,
        &config.peers,
        node.identity.public_key.clone(),
    )
    .await?;
    tokio::spawn(overlay::run(node.clone(), source, ctl_rx));

    // Every node rendezvouses on the default topic.
    overlay::join_topic(&node, DEFAULT_TOPIC, None).await;

    reaper::spawn_all(node.clone());

    api::serve(node).await
}
