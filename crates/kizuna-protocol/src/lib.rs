pub mod constants;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod message;
pub mod task;
pub mod topic;

pub use constants::*;
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use manifest::Manifest;
pub use message::PeerMessage;
