use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{INCOMING_MESSAGE, MAX_CONTROL_PAYLOAD};

/// Control-plane envelope exchanged between nodes.
///
/// `id` is always the *originator's* node id and `key` the hex digest of the
/// human key, so replicas namespace each file under its owner and never
/// confuse two owners' files that happen to share a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Announces that `size` bytes of ciphertext (IV included) follow as a
    /// raw stream on the same connection.
    StoreFile { id: String, key: String, size: u64 },
    /// Asks every peer holding `(id, key)` to stream the file back.
    GetFile { id: String, key: String },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("control payload of {0} bytes exceeds the {MAX_CONTROL_PAYLOAD} byte cap")]
    TooLarge(usize),
    #[error(transparent)]
    Encoding(#[from] bincode::Error),
}

impl Message {
    /// Encodes the full control frame: tag byte, big-endian length prefix,
    /// bincode payload.
    pub fn to_frame(&self) -> Result<Vec<u8>, MessageError> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(MessageError::TooLarge(payload.len()));
        }

        let mut frame = Vec::with_capacity(1 + 4 + payload.len());
        frame.push(INCOMING_MESSAGE);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes the payload of a control frame (tag and length already
    /// stripped by the transport decoder).
    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(bincode::deserialize(payload)?)
    }
}
