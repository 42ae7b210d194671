//! Wire protocol: control messages and binary chunk framing.
//!
//! All messages on the data channel use a compact binary envelope:
//!
//!   `[1 byte: frame_type] [N bytes: payload]`
//!
//! Frame types:
//!   0x01 = Control (JSON-encoded [`ControlMessage`])
//!   0x02 = Chunk   (binary: 16 bytes file_id + 4 bytes index BE + raw data)
//!
//! Chunk frames embed their correlation key (file id + index) in the same
//! message as the payload, so the receiver never has to pair a metadata
//! record with a separately-arriving binary blob. Reliable, ordered
//! delivery is the transport's job; the protocol still tolerates
//! out-of-order chunk indices on the receive side.

pub mod engine;

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame type marker for control messages.
pub const FRAME_CONTROL: u8 = 0x01;

/// Frame type marker for binary chunk data.
pub const FRAME_CHUNK: u8 = 0x02;

/// Chunk frame header: tag + UUID + index.
const CHUNK_HEADER_LEN: usize = 1 + 16 + 4;

// ── File metadata ────────────────────────────────────────────────────────────

/// Descriptor of one offered file. Immutable after creation; sender and
/// receiver correlate on `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: Uuid,
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    pub mime_type: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
}

impl FileMetadata {
    /// New metadata with a fresh id and the current timestamp.
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        let last_modified = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            last_modified,
        }
    }
}

// ── Control messages ─────────────────────────────────────────────────────────

/// Control messages for the transfer protocol, JSON-serialized inside
/// `FRAME_CONTROL` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Sender → receiver: the set of files on offer.
    FileOffer {
        files: Vec<FileMetadata>,
        total_size: u64,
    },
    /// Receiver → sender: start sending.
    FileAccept,
    /// Receiver → sender: abort; sender clears its offer state.
    FileReject { reason: Option<String> },
    /// Sender → receiver after a mid-transfer reconnect: discard any
    /// partial buffer for this file, it restarts from chunk zero.
    FileRestart { file_id: Uuid },
    /// Sender → receiver: the final chunk of `file_id` has been sent.
    /// `chunk_count` drives the receiver's gap check. The checksum is
    /// carried for forward compatibility and not enforced.
    FileComplete {
        file_id: Uuid,
        chunk_count: u32,
        checksum: Option<String>,
    },
    /// Sender → receiver: every offered file has been fully sent.
    TransferComplete,
    /// Either direction: abort the session; both sides discard all
    /// in-flight state.
    TransferCancel,
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// A chunk frame: one contiguous byte range of a file.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    pub file_id: Uuid,
    /// Zero-based index within the file.
    pub index: u32,
    pub payload: Bytes,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Control(ControlMessage),
    Chunk(ChunkFrame),
}

/// Encode a control frame: `[0x01][json bytes]`.
pub fn encode_control(msg: &ControlMessage) -> Result<Bytes> {
    let json = serde_json::to_vec(msg)
        .map_err(|e| Error::Protocol(format!("control encode failed: {e}")))?;
    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Encode a chunk frame: `[0x02][16 bytes uuid][4 bytes index BE][payload]`.
pub fn encode_chunk(file_id: Uuid, index: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
    buf.put_u8(FRAME_CHUNK);
    buf.extend_from_slice(file_id.as_bytes());
    buf.put_u32(index);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Decode one inbound frame.
pub fn decode(frame: Bytes) -> Result<Frame> {
    let Some(&tag) = frame.first() else {
        return Err(Error::Protocol("empty frame".into()));
    };
    match tag {
        FRAME_CONTROL => {
            let msg: ControlMessage = serde_json::from_slice(&frame[1..])
                .map_err(|e| Error::Protocol(format!("malformed control frame: {e}")))?;
            Ok(Frame::Control(msg))
        }
        FRAME_CHUNK => {
            if frame.len() < CHUNK_HEADER_LEN {
                return Err(Error::Protocol(format!(
                    "chunk frame truncated: {} bytes",
                    frame.len()
                )));
            }
            let file_id = Uuid::from_slice(&frame[1..17])
                .map_err(|e| Error::Protocol(format!("bad chunk file id: {e}")))?;
            let index = u32::from_be_bytes(
                frame[17..21]
                    .try_into()
                    .expect("slice length checked above"),
            );
            Ok(Frame::Chunk(ChunkFrame {
                file_id,
                index,
                payload: frame.slice(CHUNK_HEADER_LEN..),
            }))
        }
        other => Err(Error::Protocol(format!("unknown frame type 0x{other:02x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_round_trip() {
        let meta = FileMetadata::new("report.pdf", 12345, "application/pdf");
        let msg = ControlMessage::FileOffer {
            files: vec![meta.clone()],
            total_size: 12345,
        };
        let encoded = encode_control(&msg).unwrap();
        assert_eq!(encoded[0], FRAME_CONTROL);
        match decode(encoded).unwrap() {
            Frame::Control(ControlMessage::FileOffer { files, total_size }) => {
                assert_eq!(files, vec![meta]);
                assert_eq!(total_size, 12345);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn chunk_frame_round_trip() {
        let id = Uuid::new_v4();
        let encoded = encode_chunk(id, 7, b"payload bytes");
        assert_eq!(encoded[0], FRAME_CHUNK);
        match decode(encoded).unwrap() {
            Frame::Chunk(chunk) => {
                assert_eq!(chunk.file_id, id);
                assert_eq!(chunk.index, 7);
                assert_eq!(&chunk.payload[..], b"payload bytes");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn empty_chunk_payload_is_valid() {
        let id = Uuid::new_v4();
        match decode(encode_chunk(id, 0, b"")).unwrap() {
            Frame::Chunk(chunk) => assert!(chunk.payload.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(decode(Bytes::new()).is_err());
        assert!(decode(Bytes::from_static(&[0x7f, 1, 2])).is_err());
        assert!(decode(Bytes::from_static(&[FRAME_CHUNK, 1, 2, 3])).is_err());
        let mut bad_json = vec![FRAME_CONTROL];
        bad_json.extend_from_slice(b"{nope");
        assert!(decode(Bytes::from(bad_json)).is_err());
    }
}
