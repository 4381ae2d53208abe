use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{error::ProtocolError, keys};

/// Signed wire envelope.
///
/// `content` carries the inner payload as the exact JSON string that was
/// signed. Verifiers check the signature over those UTF-8 bytes as received;
/// the string is never re-serialised on either side. Trust is per-envelope:
/// `sender_key` itself is the verification key, there is no external anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Inner payload, serialised once at signing time.
    pub content: String,
    /// Sender's full SPKI DER public key as hex.
    pub sender_key: String,
    /// Hex Ed25519 signature over the UTF-8 bytes of `content`.
    pub signature: String,
    /// Millisecond wall clock at signing.
    pub timestamp: u64,
}

/// Millisecond wall clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Envelope {
    /// Serialise `payload` canonically, sign the bytes, and build the envelope.
    pub fn sign(payload: &Value, sender_key: &str, key: &SigningKey) -> Self {
        let content = payload.to_string();
        let sig: Signature = key.sign(content.as_bytes());
        Self {
            content,
            sender_key: sender_key.to_string(),
            signature: hex::encode(sig.to_bytes()),
            timestamp: now_ms(),
        }
    }

    /// Verify the signature against `sender_key`.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let vk = keys::verifying_key_from_spki_hex(&self.sender_key)?;
        let sig_bytes = hex::decode(&self.signature)
            .map_err(|_| ProtocolError::MalformedSignature)?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|_| ProtocolError::MalformedSignature)?;
        vk.verify(self.content.as_bytes(), &sig)
            .map_err(|_| ProtocolError::InvalidSignature)
    }

    /// Verify, then parse the inner `content` as JSON.
    pub fn open(&self) -> Result<Value, ProtocolError> {
        self.verify()?;
        serde_json::from_str(&self.content)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    /// Short identifier of the sender.
    pub fn sender_short_id(&self) -> &str {
        keys::short_id(&self.sender_key)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use serde_json::json;

    fn test_signer() -> (SigningKey, String) {
        let sk = SigningKey::generate(&mut OsRng);
        let pk = keys::spki_hex(&sk.verifying_key());
        (sk, pk)
    }

    #[test]
    fn sign_verify_round_trip() {
        let (sk, pk) = test_signer();
        let env = Envelope::sign(&json!({"type": "CHAT", "text": "hi"}), &pk, &sk);
        env.verify().unwrap();
        let inner = env.open().unwrap();
        assert_eq!(inner["type"], "CHAT");
        assert_eq!(inner["text"], "hi");
    }

    #[test]
    fn flipped_signature_byte_rejected() {
        let (sk, pk) = test_signer();
        let mut env = Envelope::sign(&json!({"type": "CHAT", "text": "hi"}), &pk, &sk);
        // Flip one nibble of the hex signature.
        let mut bytes = env.signature.into_bytes();
        bytes[0] = if bytes[0] == b'0' { b'1' } else { b'0' };
        env.signature = String::from_utf8(bytes).unwrap();
        assert!(matches!(env.verify(), Err(ProtocolError::InvalidSignature)));
    }

    #[test]
    fn tampered_content_rejected() {
        let (sk, pk) = test_signer();
        let mut env = Envelope::sign(&json!({"type": "CHAT", "text": "hi"}), &pk, &sk);
        env.content = env.content.replace("hi", "yo");
        assert!(env.verify().is_err());
    }

    #[test]
    fn verification_uses_sender_key_not_session_identity() {
        // A fresh keypair unknown to any peer table still verifies: the
        // envelope is self-proving.
        let (sk, pk) = test_signer();
        let env = Envelope::sign(&json!({"type": "handshake"}), &pk, &sk);
        assert!(env.verify().is_ok());
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let (sk, pk) = test_signer();
        let env = Envelope::sign(&json!({"a": 1}), &pk, &sk);
        let v = serde_json::to_value(&env).unwrap();
        assert!(v.get("senderKey").is_some());
        assert!(v.get("signature").is_some());
        assert!(v.get("timestamp").is_some());
        assert!(v.get("content").is_some());
    }
}
