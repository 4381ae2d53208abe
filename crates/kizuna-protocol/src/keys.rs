//! Hex codecs for the fixed Ed25519 DER encodings.
//!
//! Public keys travel as hex-encoded SPKI DER (fixed 12-byte header + 32 raw
//! bytes); private keys persist as hex-encoded PKCS8 DER (fixed 16-byte
//! header + 32-byte seed). The raw public key is therefore always the last
//! 64 hex characters of the SPKI hex, and the short identifier the last 8.

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::error::ProtocolError;

/// DER prefix of an Ed25519 SubjectPublicKeyInfo.
pub const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// DER prefix of an Ed25519 PKCS8 PrivateKeyInfo.
pub const PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70,
    0x04, 0x22, 0x04, 0x20,
];

/// Hex length of a full SPKI-encoded public key.
pub const SPKI_HEX_LEN: usize = (SPKI_PREFIX.len() + 32) * 2;

/// Encode a verifying key as SPKI DER hex — the node identifier form.
pub fn spki_hex(vk: &VerifyingKey) -> String {
    let mut der = Vec::with_capacity(SPKI_PREFIX.len() + 32);
    der.extend_from_slice(&SPKI_PREFIX);
    der.extend_from_slice(vk.as_bytes());
    hex::encode(der)
}

/// Decode an SPKI DER hex string back into a verifying key.
pub fn verifying_key_from_spki_hex(s: &str) -> Result<VerifyingKey, ProtocolError> {
    let der = hex::decode(s).map_err(|e| ProtocolError::MalformedKey(e.to_string()))?;
    if der.len() != SPKI_PREFIX.len() + 32 || der[..SPKI_PREFIX.len()] != SPKI_PREFIX {
        return Err(ProtocolError::MalformedKey("bad SPKI framing".into()));
    }
    let raw: [u8; 32] = der[SPKI_PREFIX.len()..]
        .try_into()
        .map_err(|_| ProtocolError::MalformedKey("bad key length".into()))?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|_| ProtocolError::MalformedKey("not a valid curve point".into()))
}

/// Encode a signing key as PKCS8 DER hex for the identity file.
pub fn pkcs8_hex(sk: &SigningKey) -> String {
    let mut der = Vec::with_capacity(PKCS8_PREFIX.len() + 32);
    der.extend_from_slice(&PKCS8_PREFIX);
    der.extend_from_slice(&sk.to_bytes());
    hex::encode(der)
}

/// Decode a PKCS8 DER hex string back into a signing key.
pub fn signing_key_from_pkcs8_hex(s: &str) -> Result<SigningKey, ProtocolError> {
    let der = hex::decode(s).map_err(|e| ProtocolError::MalformedSecret(e.to_string()))?;
    if der.len() != PKCS8_PREFIX.len() + 32 || der[..PKCS8_PREFIX.len()] != PKCS8_PREFIX {
        return Err(ProtocolError::MalformedSecret("bad PKCS8 framing".into()));
    }
    let seed: [u8; 32] = der[PKCS8_PREFIX.len()..]
        .try_into()
        .map_err(|_| ProtocolError::MalformedSecret("bad seed length".into()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Raw 32-byte public key form: the SPKI hex with the header stripped.
pub fn raw_hex(spki: &str) -> &str {
    if spki.len() >= 64 {
        &spki[spki.len() - 64..]
    } else {
        spki
    }
}

/// Short identifier: the last 8 hex characters of the raw form.
pub fn short_id(spki: &str) -> &str {
    if spki.len() >= 8 {
        &spki[spki.len() - 8..]
    } else {
        spki
    }
}

// ============================================================================
// Tests
// ============================================================================
