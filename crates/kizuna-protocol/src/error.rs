use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("malformed signature encoding")]
    MalformedSignature,

    #[error("malformed private key: {0}")]
    MalformedSecret(String),

    #[error("frame too large: {size} bytes exceeds {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}
