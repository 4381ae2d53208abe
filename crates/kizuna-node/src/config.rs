use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "kizuna-node", about = "Kizuna peer-to-peer bridge node")]
pub struct Config {
    /// Directory for the identity file, memory log and blob drive.
    #[arg(long, env = "KIZUNA_DATA_DIR", default_value = "kizuna-data")]
    pub data_dir: PathBuf,

    /// Control-plane HTTP port.
    #[arg(long, env = "KIZUNA_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Bind host override. Without it the plane binds loopback, unless an
    /// API key is configured, in which case it binds all interfaces.
    #[arg(long, env = "KIZUNA_BIND")]
    pub bind: Option<String>,

    /// Bearer key protecting the control plane. Health and the agent card
    /// stay public.
    #[arg(long, env = "KIZUNA_API_KEY")]
    pub api_key: Option<String>,

    /// Display name advertised in the manifest (and matched by task targets).
    #[arg(long, env = "KIZUNA_AGENT_NAME", default_value = "kizuna-agent")]
    pub agent_name: String,

    /// Advertised role.
    #[arg(long, env = "KIZUNA_ROLE", default_value = "Agent")]
    pub role: String,

    /// Advertised skill (repeatable).
    #[arg(long = "skill")]
    pub skills: Vec<String>,

    /// Overlay listen address for inbound peer streams.
    #[arg(long, env = "KIZUNA_PEER_LISTEN", default_value = "0.0.0.0:4500")]
    pub peer_listen: SocketAddr,

    /// Seed peer to dial at startup (repeatable).
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Start with the entropy reaper enabled (fault injection).
    #[arg(long, default_value_t = false)]
    pub entropy: bool,
}

impl Config {
    /// Control-plane bind host per the auth policy.
    pub fn bind_host(&self) -> &str {
        match (&self.bind, &self.api_key) {
            (Some(host), _) => host,
            (None, Some(_)) => "0.0.0.0",
            (None, None) => "127.0.0.1",
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.bind_host(), self.port)
    }

    /// Endpoint URL published in the agent card.
    pub fn a2a_url(&self) -> String {
        format!("http://localhost:{}/a2a/v1", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from(["kizuna-node"])
    }

    #[test]
    fn binds_loopback_without_api_key() {
        assert_eq!(base().bind_host(), "127.0.0.1");
    }

    #[test]
    fn binds_all_interfaces_with_api_key() {
        let mut cfg = base();
        cfg.api_key = Some("k".into());
        assert_eq!(cfg.bind_host(), "0.0.0.0");
    }

    #[test]
    fn explicit_bind_wins() {
        let mut cfg = base();
        cfg.bind = Some("10.0.0.5".into());
        cfg.api_key = Some("k".into());
        assert_eq!(cfg.bind_host(), "10.0.0.5");
    }
}
