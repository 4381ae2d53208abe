use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use kizuna_protocol::{envelope::Envelope, keys};

const IDENTITY_FILE: &str = "identity.json";

/// Long-lived node identity.
///
/// Generated once, persisted as hex DER strings, reloaded verbatim on every
/// later boot. The SPKI hex is the node identifier carried in envelopes.
pub struct NodeIdentity {
    pub signing_key: SigningKey,
    /// Full SPKI DER public key as hex.
    pub public_key: String,
    /// Last 8 hex chars of the raw key.
    pub short_id: String,
}

/// On-disk shape: `{"publicKey": <hex>, "privateKey": <hex>}`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    public_key: String,
    private_key: String,
}

impl NodeIdentity {
    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = keys::spki_hex(&signing_key.verifying_key());
        let short_id = keys::short_id(&public_key).to_string();
        Self { signing_key, public_key, short_id }
    }

    /// Load the identity file, or generate and persist a fresh keypair on
    /// first boot.
    pub fn load_or_create(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(IDENTITY_FILE);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: IdentityFile = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("corrupt identity file {path:?}: {e}"))?;
            let signing_key = keys::signing_key_from_pkcs8_hex(&file.private_key)?;
            let id = Self::from_signing_key(signing_key);
            if id.public_key != file.public_key {
                anyhow::bail!("identity file public key does not match private key");
            }
            tracing::info!(short_id = %id.short_id, "Loaded identity from {path:?}");
            Ok(id)
        } else {
            std::fs::create_dir_all(data_dir)?;
            let id = Self::from_signing_key(SigningKey::generate(&mut OsRng));
            let file = IdentityFile {
                public_key: id.public_key.clone(),
                private_key: keys::pkcs8_hex(&id.signing_key),
            };
            write_private(&path, &serde_json::to_string_pretty(&file)?)?;
            tracing::info!(short_id = %id.short_id, "Generated new identity, saved to {path:?}");
            Ok(id)
        }
    }

    /// Sign an inner payload into a wire envelope.
    pub fn sign(&self, payload: &Value) -> Envelope {
        Envelope::sign(payload, &self.public_key, &self.signing_key)
    }
}

/// mode 0o600: the private key must never be group- or world-readable.
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    #[cfg(unix)]
    let mut file = std::fs::OpenOptions::new()
        .write(true).create(true).truncate(true).mode(0o600)
        .open(path)?;
    #[cfg(not(unix))]
    let mut file = std::fs::OpenOptions::new()
        .write(true).create(true).truncate(true)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_boot_persists_then_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = NodeIdentity::load_or_create(dir.path()).unwrap();
        let second = NodeIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(first.public_key, second.public_key);
        assert_eq!(first.short_id, second.short_id);
        assert_eq!(first.short_id.len(), 8);
    }

    #[test]
    fn identity_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let id = NodeIdentity::load_or_create(dir.path()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join(IDENTITY_FILE)).unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["publicKey"], id.public_key);
        assert!(v["privateKey"].as_str().unwrap().len() > 64);
    }

    #[test]
    fn signed_envelope_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let id = NodeIdentity::load_or_create(dir.path()).unwrap();
        let env = id.sign(&json!({"type": "handshake"}));
        assert!(env.verify().is_ok());
        assert_eq!(env.sender_key, id.public_key);
    }
}
