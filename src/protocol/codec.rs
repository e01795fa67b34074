//! Binary frame codec: `[tag: u8][payload: CBOR]`.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Message, TAG_ERROR, TAG_JOIN, TAG_OPERATION, TAG_PROGRESS, TAG_SYNCED};
use crate::error::{CrdtError, Result};

/// Encodes a message into a single binary frame.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut frame = vec![message.tag()];
    match message {
        Message::Join(payload) => write_payload(payload, &mut frame)?,
        Message::Synced(payload) => write_payload(payload, &mut frame)?,
        Message::Operation(payload) => write_payload(payload, &mut frame)?,
        Message::Error(payload) => write_payload(payload, &mut frame)?,
        Message::Progress(payload) => write_payload(payload, &mut frame)?,
    }
    Ok(frame)
}

/// Decodes a binary frame.
///
/// Unknown tags, empty frames and payloads that fail validation (including
/// operation validation) are rejected with [`CrdtError::Codec`].
pub fn decode(frame: &[u8]) -> Result<Message> {
    let (&tag, payload) = frame
        .split_first()
        .ok_or_else(|| CrdtError::Codec("empty frame".to_string()))?;
    let message = match tag {
        TAG_JOIN => Message::Join(read_payload(payload)?),
        TAG_SYNCED => Message::Synced(read_payload(payload)?),
        TAG_OPERATION => Message::Operation(read_payload(payload)?),
        TAG_ERROR => Message::Error(read_payload(payload)?),
        TAG_PROGRESS => Message::Progress(read_payload(payload)?),
        other => return Err(CrdtError::Codec(format!("unknown message tag {}", other))),
    };
    Ok(message)
}

fn write_payload<T: Serialize>(payload: &T, frame: &mut Vec<u8>) -> Result<()> {
    ciborium::ser::into_writer(payload, frame).map_err(|e| CrdtError::Codec(e.to_string()))
}

fn read_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    ciborium::de::from_reader(payload).map_err(|e| CrdtError::Codec(e.to_string()))
}
