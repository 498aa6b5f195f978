//! Framing: one-byte kind + big-endian u16 + body. No length prefix; one frame per transport message.

use crate::protocol::{Frame, ANNOUNCE_LEN, DATA_HEADER_LEN, FRAME_ANNOUNCE, FRAME_DATA};

/// Encode a frame for a transport that carries at most `mtu` bytes per message.
pub fn encode_frame(frame: &Frame, mtu: usize) -> Result<Vec<u8>, FrameEncodeError> {
    let len = frame.encoded_len();
    if len > mtu {
        return Err(FrameEncodeError::TooLarge { len, mtu });
    }
    let mut out = Vec::with_capacity(len);
    match frame {
        Frame::Announce {
            total_packets,
            version,
        } => {
            out.push(FRAME_ANNOUNCE);
            out.extend_from_slice(&total_packets.to_be_bytes());
            out.push(*version);
        }
        Frame::Data { sequence, payload } => {
            out.push(FRAME_DATA);
            out.extend_from_slice(&sequence.to_be_bytes());
            out.extend_from_slice(payload);
        }
    }
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame of {len} bytes exceeds transport limit of {mtu}")]
    TooLarge { len: usize, mtu: usize },
}

/// Decode one complete frame. The whole buffer is the frame; trailing bytes after an Announce are ignored.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    let Some(&kind) = bytes.first() else {
        return Err(FrameDecodeError::Empty);
    };
    match kind {
        FRAME_ANNOUNCE => {
            if bytes.len() < ANNOUNCE_LEN {
                return Err(FrameDecodeError::Truncated {
                    kind,
                    len: bytes.len(),
                    min: ANNOUNCE_LEN,
                });
            }
            Ok(Frame::Announce {
                total_packets: u16::from_be_bytes([bytes[1], bytes[2]]),
                version: bytes[3],
            })
        }
        FRAME_DATA => {
            if bytes.len() < DATA_HEADER_LEN {
                return Err(FrameDecodeError::Truncated {
                    kind,
                    len: bytes.len(),
                    min: DATA_HEADER_LEN,
                });
            }
            Ok(Frame::Data {
                sequence: u16::from_be_bytes([bytes[1], bytes[2]]),
                payload: bytes[DATA_HEADER_LEN..].to_vec(),
            })
        }
        other => Err(FrameDecodeError::UnknownKind(other)),
    }
}

/// Error decoding a frame (empty, unknown kind, or shorter than its header).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("frame kind 0x{kind:02x} truncated: {len} bytes, need at least {min}")]
    Truncated { kind: u8, len: usize, min: usize },
}
