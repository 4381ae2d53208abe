use sha2::{Digest, Sha256};

/// Rendezvous hash for a topic.
///
/// Public: SHA-256 of the topic name alone. Private: SHA-256 of
/// `name + ":" + secret`, so peers must share the secret to meet.
/// An empty secret counts as public.
pub fn topic_hash(name: &str, secret: Option<&str>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match secret {
        Some(s) if !s.is_empty() => {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(s.as_bytes());
        }
        _ => hasher.update(name.as_bytes()),
    }
    hasher.finalize().into()
}

pub fn topic_hash_hex(name: &str, secret: Option<&str>) -> String {
    hex::encode(topic_hash(name, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(topic_hash("swarm", None), topic_hash("swarm", None));
    }

    #[test]
    fn secret_changes_hash() {
        assert_ne!(topic_hash("swarm", None), topic_hash("swarm", Some("s3cret")));
        assert_ne!(
            topic_hash("swarm", Some("a")),
            topic_hash("swarm", Some("b"))
        );
    }

    #[test]
    fn empty_secret_is_public() {
        assert_eq!(topic_hash("swarm", Some("")), topic_hash("swarm", None));
    }

    #[test]
    fn known_digest() {
        // SHA-256("swarm")
        assert_eq!(
            topic_hash_hex("swarm", None),
            "44eb92b46360c22af3395633b6e3014a30afa97b02305b385c51d3feebceda9c"
        );
    }
}
